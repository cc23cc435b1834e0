use crate::codec::FRAME_RATE;

/// Parameters handed to the encoder process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// ffmpeg demuxer used as the grabber (`gdigrab`, `x11grab`, `avfoundation`)
    pub input_format: String,
    /// Grabber input (`desktop`, an X display, an avfoundation device index)
    pub input: String,
    pub video_size: String,
    pub bitrate: String,
    pub threads: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        let (input_format, input) = platform_input();
        Self {
            input_format: input_format.to_string(),
            input,
            video_size: "1920x1080".to_string(),
            bitrate: "1M".to_string(),
            threads: 4,
        }
    }
}

impl CaptureSettings {
    /// Full ffmpeg argument list: grab the screen, encode VP8, write IVF to stdout
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let framerate = FRAME_RATE.to_string();
        let threads = self.threads.to_string();

        [
            "-f",
            self.input_format.as_str(),
            "-video_size",
            self.video_size.as_str(),
            "-framerate",
            framerate.as_str(),
            "-i",
            self.input.as_str(),
            "-pix_fmt",
            "yuv420p",
            "-c:v",
            "libvpx",
            "-b:v",
            self.bitrate.as_str(),
            "-bufsize",
            self.bitrate.as_str(),
            "-threads",
            threads.as_str(),
            "-deadline",
            "realtime",
            "-f",
            "ivf",
            "-",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

#[cfg(target_os = "windows")]
fn platform_input() -> (&'static str, String) {
    ("gdigrab", "desktop".to_string())
}

#[cfg(target_os = "macos")]
fn platform_input() -> (&'static str, String) {
    ("avfoundation", "1:none".to_string())
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn platform_input() -> (&'static str, String) {
    let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".to_string());
    ("x11grab", display)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_args_produce_vp8_ivf_on_stdout() {
        let settings = CaptureSettings {
            input_format: "x11grab".to_string(),
            input: ":1".to_string(),
            video_size: "1280x720".to_string(),
            bitrate: "2M".to_string(),
            threads: 2,
        };
        let args = settings.ffmpeg_args();

        assert_eq!(value_after(&args, "-f"), vec!["x11grab", "ivf"]);
        assert_eq!(value_after(&args, "-i"), vec![":1"]);
        assert_eq!(value_after(&args, "-c:v"), vec!["libvpx"]);
        assert_eq!(value_after(&args, "-video_size"), vec!["1280x720"]);
        assert_eq!(value_after(&args, "-framerate"), vec!["30"]);
        assert_eq!(value_after(&args, "-b:v"), vec!["2M"]);
        assert_eq!(value_after(&args, "-threads"), vec!["2"]);
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_grabber_comes_before_input() {
        let args = CaptureSettings::default().ffmpeg_args();
        let grabber = args.iter().position(|a| a == "-f").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(grabber < input);
    }
}
