use super::{BridgeError, EncoderProcess};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Encoder child process.
///
/// Spawned with `kill_on_drop`, so a handle dropped without [`EncoderProcess::terminate`]
/// (for example while a panicking bridge task unwinds) still kills the process.
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl EncoderProcess for ChildProcess {
    async fn terminate(&mut self) -> std::io::Result<()> {
        if let Some(status) = self.child.try_wait()? {
            tracing::debug!("Encoder already exited with {}", status);
            return Ok(());
        }

        // kill() sends SIGKILL and then waits, which reaps the child
        self.child.kill().await?;
        tracing::debug!("Encoder terminated");
        Ok(())
    }
}

pub struct SpawnedEncoder {
    pub process: ChildProcess,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

pub fn spawn_encoder(program: &str, args: &[String]) -> Result<SpawnedEncoder, BridgeError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BridgeError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = child.stdout.take().ok_or(BridgeError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take();

    tracing::debug!("Encoder started with pid {:?}", child.id());

    Ok(SpawnedEncoder {
        process: ChildProcess { child },
        stdout,
        stderr,
    })
}

/// Log the encoder's stderr line by line until it closes or `cancel` fires
pub fn drain_diagnostics(stderr: ChildStderr, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => tracing::debug!(target: "encoder", "{}", line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Error reading encoder stderr: {}", e);
                        break;
                    }
                },
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_terminate_kills_and_reaps() {
        let mut spawned = spawn_encoder("sleep", &["30".to_string()]).unwrap();
        assert!(spawned.process.id().is_some());

        tokio::time::timeout(Duration::from_secs(5), spawned.process.terminate())
            .await
            .unwrap()
            .unwrap();

        // Reaped: the OS pid is released
        assert!(spawned.process.id().is_none());

        // A second request finds the exited process and does nothing
        spawned.process.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_after_natural_exit() {
        let mut spawned = spawn_encoder("true", &[]).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        spawned.process.terminate().await.unwrap();
        assert!(spawned.process.id().is_none());
    }

    #[tokio::test]
    async fn test_diagnostics_drain_ends_with_the_process() {
        let spawned = spawn_encoder(
            "sh",
            &["-c".to_string(), "echo 'frame=1 fps=30' >&2".to_string()],
        )
        .unwrap();

        let drain = drain_diagnostics(spawned.stderr.unwrap(), CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .unwrap()
            .unwrap();
    }
}
