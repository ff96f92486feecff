//! Training summaries.
//!
//! The chief appends one JSON line per event under the log directory:
//! scalars for the validation loss and the learning rate, and histogram
//! statistics for every trainable parameter block.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
};

/// The JSON-lines event writer.
pub struct SummaryWriter {
    out: BufWriter<File>,
}

impl SummaryWriter {
    /// Opens (appending) the event file under `logdir`.
    pub fn create(logdir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(logdir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logdir.join("events.jsonl"))?;

        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Appends a scalar event.
    pub fn scalar(&mut self, step: i64, tag: &str, value: f32) -> io::Result<()> {
        let event = serde_json::json!({
            "step": step,
            "tag": tag,
            "scalar": value,
        });

        writeln!(self.out, "{event}")?;
        self.out.flush()
    }

    /// Appends histogram statistics for one parameter block.
    pub fn histogram(&mut self, step: i64, tag: &str, values: &[f32]) -> io::Result<()> {
        let count = values.len();
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0_f64;
        let mut sum_sq = 0.0_f64;

        for &v in values {
            min = min.min(v);
            max = max.max(v);
            sum += f64::from(v);
            sum_sq += f64::from(v) * f64::from(v);
        }

        let mean = if count > 0 { sum / count as f64 } else { 0.0 };
        let variance = if count > 0 {
            (sum_sq / count as f64 - mean * mean).max(0.0)
        } else {
            0.0
        };

        let event = serde_json::json!({
            "step": step,
            "tag": tag,
            "histogram": {
                "count": count,
                "min": if count > 0 { min } else { 0.0 },
                "max": if count > 0 { max } else { 0.0 },
                "mean": mean,
                "stddev": variance.sqrt(),
            },
        });

        writeln!(self.out, "{event}")?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_append_as_json_lines() {
        let dir = std::env::temp_dir().join(format!("trainer-events-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut writer = SummaryWriter::create(&dir).unwrap();
        writer.scalar(3, "validation loss", 1.5).unwrap();
        writer.histogram(3, "layer0/weights", &[0.0, 1.0, -1.0]).unwrap();

        let content = std::fs::read_to_string(dir.join("events.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let scalar: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(scalar["tag"], "validation loss");
        assert_eq!(scalar["step"], 3);

        let histogram: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(histogram["histogram"]["count"], 3);
        assert_eq!(histogram["histogram"]["max"], 1.0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
