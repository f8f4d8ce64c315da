//! CSV output sinks, one append-only file per device

use crate::error::{GyroError, Result};
use crate::ism330dhcx::GyroReading;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// File name prefix; device `i` writes to `sensor{i}.csv`
pub const SINK_PREFIX: &str = "sensor";
pub const SINK_EXTENSION: &str = "csv";
pub const SINK_HEADER: &str = "time,x,y,z";

/// Path of the sink for device `index` inside `dir`
pub fn sink_path<P: AsRef<Path>>(dir: P, index: usize) -> PathBuf {
    dir.as_ref()
        .join(format!("{}{}.{}", SINK_PREFIX, index, SINK_EXTENSION))
}

/// Sample with timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRecord {
    /// Wall-clock nanoseconds since the Unix epoch
    pub timestamp_ns: i64,
    pub reading: GyroReading,
}

impl fmt::Display for SampleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.timestamp_ns, self.reading.x, self.reading.y, self.reading.z
        )
    }
}

impl SampleRecord {
    /// Parse one data row
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim().split(',');
        let timestamp_ns = fields.next()?.parse().ok()?;
        let x = fields.next()?.parse().ok()?;
        let y = fields.next()?.parse().ok()?;
        let z = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            timestamp_ns,
            reading: GyroReading { x, y, z },
        })
    }
}

/// Append-only CSV writer for one device
pub struct CsvSink {
    writer: BufWriter<File>,
}

impl CsvSink {
    /// Open `path` for appending, writing the header only into an empty file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
        let is_empty = file.metadata()?.len() == 0;

        let mut writer = BufWriter::new(file);
        if is_empty {
            writeln!(writer, "{}", SINK_HEADER)?;
        }

        Ok(Self { writer })
    }

    pub fn append(&mut self, record: &SampleRecord) -> Result<()> {
        writeln!(self.writer, "{}", record)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and close
    pub fn finish(mut self) -> Result<()> {
        self.flush()
    }
}

/// The sinks of one sampling session, indexed like the device registry
pub struct SinkSet {
    sinks: Vec<CsvSink>,
}

impl SinkSet {
    /// Create `dir` if needed and open `sensor0.csv` .. `sensor{count-1}.csv`
    pub fn open<P: AsRef<Path>>(dir: P, count: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let sinks = (0..count)
            .map(|index| CsvSink::open(sink_path(dir, index)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { sinks })
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn append(&mut self, index: usize, record: &SampleRecord) -> Result<()> {
        let sink = self.sinks.get_mut(index).ok_or_else(|| {
            GyroError::InvalidParameter(format!("no sink for device index {}", index))
        })?;
        sink.append(record)
    }

    /// Flush every sink; all are attempted, the first error is returned
    pub fn flush_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flush and close every sink, leaving the set empty
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for sink in self.sinks.drain(..) {
            if let Err(e) = sink.finish() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Remove sink files left in `dir` by earlier sessions; returns how many
pub fn clear_directory<P: AsRef<Path>>(dir: P) -> Result<usize> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_sink = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| {
                name.strip_prefix(SINK_PREFIX)
                    .and_then(|rest| rest.strip_suffix(&format!(".{}", SINK_EXTENSION)))
                    .map_or(false, |index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
            })
            .unwrap_or(false);
        if is_sink && path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Read every data row of a sink file
pub fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<SampleRecord>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut records = Vec::new();

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.trim() == SINK_HEADER {
            continue;
        }
        let record = SampleRecord::parse(&line).ok_or_else(|| {
            GyroError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}:{}: malformed row '{}'", path.as_ref().display(), number + 1, line),
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}
