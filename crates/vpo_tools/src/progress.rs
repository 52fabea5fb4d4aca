//! Transcoder progress parsing.
//!
//! ffmpeg's `-progress` output is a stream of `key=value` lines terminated
//! by a `progress=continue|end` marker per block. Parsing is a pure
//! function from lines to [`ProgressTick`]s; consumers subscribe to ticks
//! for UI and database updates.

/// One progress snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressTick {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub bitrate: Option<String>,
    pub speed: Option<f64>,
    pub out_time_seconds: Option<f64>,
}

/// `HH:MM:SS.fff` or a bare seconds value.
pub fn parse_time_to_seconds(raw: &str) -> f64 {
    if raw.contains(':') {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() == 3 {
            let hours: f64 = parts[0].parse().unwrap_or(0.0);
            let minutes: f64 = parts[1].parse().unwrap_or(0.0);
            let seconds: f64 = parts[2].parse().unwrap_or(0.0);
            return hours * 3600.0 + minutes * 60.0 + seconds;
        }
    }
    raw.parse().unwrap_or(0.0)
}

/// Apply one `key=value` line to a tick under construction. Returns true
/// when the line closes a block (`progress=...`).
pub fn parse_progress_line(line: &str, tick: &mut ProgressTick) -> bool {
    let trimmed = line.trim();
    let Some((key, value)) = trimmed.split_once('=') else {
        return false;
    };

    match key {
        "frame" => tick.frame = value.parse().ok(),
        "fps" => tick.fps = value.parse().ok(),
        "bitrate" => {
            if value != "N/A" {
                tick.bitrate = Some(value.to_string());
            }
        }
        "speed" => {
            let value = value.trim_end_matches('x');
            tick.speed = value.parse().ok();
        }
        "out_time" => tick.out_time_seconds = Some(parse_time_to_seconds(value)),
        // out_time_ms is actually microseconds (ffmpeg ticket #7345).
        "out_time_ms" => {
            if tick.out_time_seconds.is_none() {
                if let Ok(us) = value.parse::<f64>() {
                    tick.out_time_seconds = Some(us / 1_000_000.0);
                }
            }
        }
        "progress" => return true,
        _ => {}
    }
    false
}

/// Stateful line feeder: collects lines into blocks and emits a tick per
/// completed block.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressTick,
    finished: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a completed tick when the block closes.
    pub fn feed(&mut self, line: &str) -> Option<ProgressTick> {
        if line.trim().starts_with("progress=") {
            if line.trim() == "progress=end" {
                self.finished = true;
            }
            let tick = std::mem::take(&mut self.current);
            return Some(tick);
        }
        parse_progress_line(line, &mut self.current);
        None
    }

    /// True once a `progress=end` marker has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_parsing_emits_one_tick() {
        let mut parser = ProgressParser::new();
        assert!(parser.feed("frame=100").is_none());
        assert!(parser.feed("fps=48.5").is_none());
        assert!(parser.feed("bitrate=1500.2kbits/s").is_none());
        assert!(parser.feed("out_time=00:00:10.500000").is_none());
        assert!(parser.feed("speed=2.01x").is_none());

        let tick = parser.feed("progress=continue").unwrap();
        assert_eq!(tick.frame, Some(100));
        assert_eq!(tick.fps, Some(48.5));
        assert_eq!(tick.bitrate.as_deref(), Some("1500.2kbits/s"));
        assert_eq!(tick.speed, Some(2.01));
        assert!((tick.out_time_seconds.unwrap() - 10.5).abs() < 1e-6);
        assert!(!parser.is_finished());
    }

    #[test]
    fn out_time_ms_is_microseconds() {
        let mut tick = ProgressTick::default();
        parse_progress_line("out_time_ms=1234567", &mut tick);
        assert!((tick.out_time_seconds.unwrap() - 1.234567).abs() < 1e-9);
    }

    #[test]
    fn out_time_wins_over_out_time_ms() {
        let mut tick = ProgressTick::default();
        parse_progress_line("out_time=00:00:00.820000", &mut tick);
        parse_progress_line("out_time_ms=9999999", &mut tick);
        assert!((tick.out_time_seconds.unwrap() - 0.82).abs() < 1e-9);
    }

    #[test]
    fn end_marker_finishes_the_stream() {
        let mut parser = ProgressParser::new();
        parser.feed("frame=1");
        let tick = parser.feed("progress=end").unwrap();
        assert_eq!(tick.frame, Some(1));
        assert!(parser.is_finished());
    }

    #[test]
    fn time_parsing_accepts_both_forms() {
        assert!((parse_time_to_seconds("01:02:03.5") - 3723.5).abs() < 1e-9);
        assert!((parse_time_to_seconds("42.25") - 42.25).abs() < 1e-9);
        assert_eq!(parse_time_to_seconds("garbage"), 0.0);
    }

    #[test]
    fn na_bitrate_is_ignored() {
        let mut tick = ProgressTick::default();
        parse_progress_line("bitrate=N/A", &mut tick);
        assert_eq!(tick.bitrate, None);
    }
}
