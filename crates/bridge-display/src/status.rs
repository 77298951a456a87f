//! Per-display status files for the service tooling.
//!
//! One `display-<id>.status` file per active mapping, replaced
//! atomically (write to `.tmp`, rename) so readers never see a torn
//! file. `/var/run/ndi-display` is tmpfs and preferred; `/tmp` is the
//! fallback for unprivileged runs.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes and removes one display's status file.
pub struct StatusReporter {
    display_id: usize,
    path: PathBuf,
    tmp_path: PathBuf,
}

/// Parsed view of one status file, as read back by the `status` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusEntry {
    pub display_id: usize,
    pub stream_name: String,
    pub pid: u32,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

/// The preferred status directory, falling back to /tmp.
#[must_use]
pub fn status_dir() -> PathBuf {
    let preferred = PathBuf::from("/var/run/ndi-display");
    if fs::create_dir_all(&preferred).is_ok() {
        return preferred;
    }
    let fallback = PathBuf::from("/tmp/ndi-display");
    let _ = fs::create_dir_all(&fallback);
    fallback
}

impl StatusReporter {
    #[must_use]
    pub fn new(display_id: usize) -> Self {
        Self::new_in(&status_dir(), display_id)
    }

    #[must_use]
    pub fn new_in(dir: &Path, display_id: usize) -> Self {
        let path = dir.join(format!("display-{display_id}.status"));
        let tmp_path = path.with_extension("status.tmp");
        Self {
            display_id,
            path,
            tmp_path,
        }
    }

    /// Replace the status file. Failures are ignored: status reporting
    /// never interferes with the video path.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        stream_name: &str,
        width: u32,
        height: u32,
        fps: f32,
        bitrate_mbps: f32,
        frames_received: u64,
        frames_dropped: u64,
    ) {
        let Ok(mut file) = fs::File::create(&self.tmp_path) else {
            return;
        };
        let body = format!(
            "STREAM_NAME=\"{stream_name}\"\n\
             DISPLAY_ID={}\n\
             PID={}\n\
             RESOLUTION={width}x{height}\n\
             FPS={fps:.1}\n\
             BITRATE={bitrate_mbps:.2}\n\
             FRAMES_RECEIVED={frames_received}\n\
             FRAMES_DROPPED={frames_dropped}\n\
             TIMESTAMP={}\n",
            self.display_id,
            std::process::id(),
            local_timestamp(),
        );
        if file.write_all(body.as_bytes()).is_err() {
            return;
        }
        drop(file);
        let _ = fs::rename(&self.tmp_path, &self.path);
    }

    /// Remove the status file.
    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for StatusReporter {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Every `display-*.status` file in `dir`, sorted by display id.
#[must_use]
pub fn read_entries(dir: &Path) -> Vec<StatusEntry> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut parsed: Vec<StatusEntry> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with("display-") && name.ends_with(".status")
        })
        .filter_map(|e| fs::read_to_string(e.path()).ok())
        .map(|body| parse_entry(&body))
        .collect();
    parsed.sort_by_key(|e| e.display_id);
    parsed
}

fn parse_entry(body: &str) -> StatusEntry {
    let mut entry = StatusEntry::default();
    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "STREAM_NAME" => entry.stream_name = value.trim_matches('"').to_string(),
            "DISPLAY_ID" => entry.display_id = value.parse().unwrap_or(0),
            "PID" => entry.pid = value.parse().unwrap_or(0),
            "RESOLUTION" => {
                if let Some((w, h)) = value.split_once('x') {
                    entry.width = w.parse().unwrap_or(0);
                    entry.height = h.parse().unwrap_or(0);
                }
            }
            "FPS" => entry.fps = value.parse().unwrap_or(0.0),
            "FRAMES_RECEIVED" => entry.frames_received = value.parse().unwrap_or(0),
            "FRAMES_DROPPED" => entry.frames_dropped = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    entry
}

/// Local time as `YYYY-MM-DDTHH:MM:SS`, matching the service tooling.
fn local_timestamp() -> String {
    // SAFETY: localtime_r with out-param struct; no shared state.
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        if libc::localtime_r(&now, &mut tm).is_null() {
            return String::new();
        }
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            tm.tm_year + 1900,
            tm.tm_mon + 1,
            tm.tm_mday,
            tm.tm_hour,
            tm.tm_min,
            tm.tm_sec,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = StatusReporter::new_in(dir.path(), 1);
        reporter.update("Camera 1", 1920, 1080, 59.94, 105.3, 1234, 5);

        let entries = read_entries(dir.path());
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.display_id, 1);
        assert_eq!(entry.stream_name, "Camera 1");
        assert_eq!(entry.width, 1920);
        assert_eq!(entry.height, 1080);
        assert_eq!(entry.frames_received, 1234);
        assert_eq!(entry.frames_dropped, 5);

        reporter.clear();
        assert!(read_entries(dir.path()).is_empty());
    }

    #[test]
    fn update_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = StatusReporter::new_in(dir.path(), 0);
        reporter.update("A", 640, 480, 30.0, 1.0, 1, 0);
        reporter.update("B", 640, 480, 30.0, 1.0, 2, 0);

        let entries = read_entries(dir.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stream_name, "B");
        assert_eq!(entries[0].frames_received, 2);
        // No leftover temp file.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reporter = StatusReporter::new_in(dir.path(), 2);
            reporter.update("X", 1280, 720, 60.0, 50.0, 10, 0);
            assert_eq!(read_entries(dir.path()).len(), 1);
        }
        assert!(read_entries(dir.path()).is_empty());
    }

    #[test]
    fn unmapping_one_of_three_keeps_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporters: Vec<_> =
            (0..3).map(|i| StatusReporter::new_in(dir.path(), i)).collect();
        for (i, r) in reporters.iter().enumerate() {
            r.update(&format!("Source {i}"), 1920, 1080, 60.0, 100.0, 1, 0);
        }
        assert_eq!(read_entries(dir.path()).len(), 3);

        drop(reporters.remove(1));
        let entries = read_entries(dir.path());
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.display_id != 1));
    }
}
