//! Command construction for the external transcoder.
//!
//! Two invocations of the same executable: a long-lived RTSP→HLS remux
//! writing a small deleting segment window, and a one-shot extractor that
//! pulls a single JPEG out of a segment. The pipeline and the transcoder
//! communicate only through files in the session's scratch directory.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::state::TranscodeConfig;

/// Rolling playlist filename inside each session's scratch directory.
pub(crate) const PLAYLIST_NAME: &str = "playlist.m3u8";

/// Magic marker a valid playlist must start with.
pub(crate) const PLAYLIST_MAGIC: &str = "#EXTM3U";

/// Bytes of input probed before the transcoder commits to a stream layout.
const PROBE_SIZE: u64 = 5_000_000;

/// Microseconds of input analyzed for codec parameters.
const ANALYZE_DURATION_USEC: u64 = 5_000_000;

/// RTSP socket I/O timeout in microseconds.
const SOCKET_TIMEOUT_USEC: u64 = 5_000_000;

/// Maximum muxer delay in microseconds.
const MAX_DELAY_USEC: u64 = 500_000;

/// Builds the long-lived RTSP→HLS transcoder invocation.
///
/// The child is placed in its own process group so the whole subtree can be
/// signalled on teardown.
pub(crate) fn hls_command(config: &TranscodeConfig, rtsp_url: &str, output_dir: &Path) -> Command {
    let playlist = output_dir.join(PLAYLIST_NAME);
    let segments = output_dir.join("seg%03d.ts");

    let mut cmd = Command::new(&config.ffmpeg_path);
    cmd.arg("-probesize")
        .arg(PROBE_SIZE.to_string())
        .arg("-analyzeduration")
        .arg(ANALYZE_DURATION_USEC.to_string())
        .arg("-rtsp_transport")
        .arg("tcp")
        .arg("-timeout")
        .arg(SOCKET_TIMEOUT_USEC.to_string())
        .arg("-i")
        .arg(rtsp_url)
        .arg("-c:v")
        .arg("copy")
        .arg("-bsf:v")
        .arg("hevc_mp4toannexb")
        .arg("-tag:v")
        .arg("hvc1")
        .arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg("128k")
        .arg("-f")
        .arg("hls")
        .arg("-hls_time")
        .arg(config.segment_seconds.to_string())
        .arg("-hls_list_size")
        .arg(config.playlist_size.to_string())
        .arg("-hls_flags")
        .arg("delete_segments+append_list+independent_segments")
        .arg("-hls_allow_cache")
        .arg("0")
        .arg("-hls_segment_filename")
        .arg(segments)
        .arg("-fflags")
        .arg("+nobuffer+genpts")
        .arg("-flags")
        .arg("low_delay")
        .arg("-max_delay")
        .arg(MAX_DELAY_USEC.to_string())
        .arg("-start_at_zero")
        .arg("-y")
        .arg(playlist);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    #[cfg(windows)]
    cmd.creation_flags(windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP);

    cmd
}

/// Builds the one-shot frame extractor: a single JPEG at quality 2 from the
/// given segment.
pub(crate) fn extract_command(config: &TranscodeConfig, segment: &Path, output: &Path) -> Command {
    let mut cmd = Command::new(&config.ffmpeg_path);
    cmd.arg("-i")
        .arg(segment)
        .arg("-frames:v")
        .arg("1")
        .arg("-q:v")
        .arg("2")
        .arg("-y")
        .arg(output);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn hls_command_targets_playlist_in_output_dir() {
        let config = TranscodeConfig::default();
        let cmd = hls_command(&config, "rtsp://cam/1", Path::new("/tmp/scratch"));
        let args = args_of(&cmd);

        assert!(args.contains(&"rtsp://cam/1".to_string()));
        assert!(args.contains(&"tcp".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/scratch/playlist.m3u8");
    }

    #[test]
    fn hls_command_uses_configured_window() {
        let config = TranscodeConfig {
            segment_seconds: 4,
            playlist_size: 8,
            ..Default::default()
        };
        let cmd = hls_command(&config, "rtsp://cam/1", Path::new("/tmp/scratch"));
        let args = args_of(&cmd);

        let time_at = args.iter().position(|a| a == "-hls_time").unwrap();
        assert_eq!(args[time_at + 1], "4");
        let size_at = args.iter().position(|a| a == "-hls_list_size").unwrap();
        assert_eq!(args[size_at + 1], "8");
        assert!(args.contains(&"delete_segments+append_list+independent_segments".to_string()));
    }

    #[test]
    fn extract_command_emits_single_high_quality_frame() {
        let config = TranscodeConfig::default();
        let cmd = extract_command(
            &config,
            Path::new("/tmp/scratch/seg004.ts"),
            Path::new("/tmp/scratch/7_latest.jpg"),
        );
        let args = args_of(&cmd);

        let frames_at = args.iter().position(|a| a == "-frames:v").unwrap();
        assert_eq!(args[frames_at + 1], "1");
        let quality_at = args.iter().position(|a| a == "-q:v").unwrap();
        assert_eq!(args[quality_at + 1], "2");
        assert_eq!(args.last().unwrap(), "/tmp/scratch/7_latest.jpg");
    }
}
