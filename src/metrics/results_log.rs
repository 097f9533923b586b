//! `|`-separated results log, one row per executed operation.

use super::LatencyRecord;
use crate::workload::OperationType;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Lines, Write};
use std::iter::Enumerate;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RESULTS_LOG_SEPARATOR: char = '|';
pub const RESULTS_LOG_HEADER: [&str; 5] = [
    "operation_type",
    "scheduled_start_time",
    "actual_start_time",
    "execution_duration",
    "result_code",
];

#[derive(Debug, Error)]
pub enum ResultsLogError {
    #[error("results log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("results log {path} line {line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Destination of latency rows. The null sink drops everything.
#[derive(Debug)]
pub enum ResultsLogSink {
    Null,
    Csv(CsvResultsLog),
}

impl ResultsLogSink {
    pub fn create(path: Option<&Path>, flush_each_row: bool) -> Result<Self, ResultsLogError> {
        match path {
            Some(path) => Ok(ResultsLogSink::Csv(CsvResultsLog::create(path, flush_each_row)?)),
            None => Ok(ResultsLogSink::Null),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            ResultsLogSink::Null => None,
            ResultsLogSink::Csv(log) => Some(log.path()),
        }
    }

    pub fn write(&mut self, record: &LatencyRecord) -> Result<(), ResultsLogError> {
        match self {
            ResultsLogSink::Null => Ok(()),
            ResultsLogSink::Csv(log) => log.write(record),
        }
    }

    pub fn finish(&mut self) -> Result<(), ResultsLogError> {
        match self {
            ResultsLogSink::Null => Ok(()),
            ResultsLogSink::Csv(log) => log.flush(),
        }
    }
}

#[derive(Debug)]
pub struct CsvResultsLog {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_each_row: bool,
    rows: u64,
}

impl CsvResultsLog {
    pub fn create(path: &Path, flush_each_row: bool) -> Result<Self, ResultsLogError> {
        let io_err = |source: io::Error| ResultsLogError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", RESULTS_LOG_HEADER.join("|")).map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            flush_each_row,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn write(&mut self, record: &LatencyRecord) -> Result<(), ResultsLogError> {
        // Durations are written in milliseconds with microsecond precision.
        let duration_ms = record.duration_ns as f64 / 1_000_000.0;
        writeln!(
            self.writer,
            "{}|{}|{}|{:.3}|{}",
            record.op_type, record.scheduled_ms, record.actual_ms, duration_ms, record.outcome
        )
        .map_err(|source| ResultsLogError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.rows += 1;
        if self.flush_each_row {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ResultsLogError> {
        self.writer.flush().map_err(|source| ResultsLogError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Reads every row of a results log, skipping the header.
pub fn read_results_log(path: &Path) -> Result<Vec<LatencyRecord>, ResultsLogError> {
    results_log_rows(path)?.collect()
}

/// Opens a results log for row-by-row reading.
pub fn results_log_rows(path: &Path) -> Result<ResultsLogRows, ResultsLogError> {
    let file = File::open(path).map_err(|source| ResultsLogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ResultsLogRows {
        path: path.to_path_buf(),
        lines: BufReader::new(file).lines().enumerate(),
    })
}

/// Streaming reader over the rows of a results log.
pub struct ResultsLogRows {
    path: PathBuf,
    lines: Enumerate<Lines<BufReader<File>>>,
}

impl Iterator for ResultsLogRows {
    type Item = Result<LatencyRecord, ResultsLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (index, line) = self.lines.next()?;
            let line = match line {
                Ok(line) => line,
                Err(source) => {
                    return Some(Err(ResultsLogError::Io {
                        path: self.path.clone(),
                        source,
                    }))
                }
            };
            if index == 0 || line.trim().is_empty() {
                continue;
            }
            return Some(parse_row(&line).map_err(|reason| ResultsLogError::Malformed {
                path: self.path.clone(),
                line: index + 1,
                reason,
            }));
        }
    }
}

fn parse_row(line: &str) -> Result<LatencyRecord, String> {
    let columns: Vec<&str> = line.split(RESULTS_LOG_SEPARATOR).collect();
    if columns.len() != RESULTS_LOG_HEADER.len() {
        return Err(format!(
            "expected {} columns, found {}",
            RESULTS_LOG_HEADER.len(),
            columns.len()
        ));
    }
    let int = |column: usize| -> Result<u64, String> {
        columns[column]
            .trim()
            .parse::<u64>()
            .map_err(|err| format!("{}: {err}", RESULTS_LOG_HEADER[column]))
    };
    let duration_ms = columns[3]
        .trim()
        .parse::<f64>()
        .map_err(|err| format!("{}: {err}", RESULTS_LOG_HEADER[3]))?;
    let outcome = columns[4]
        .trim()
        .parse::<i32>()
        .map_err(|err| format!("{}: {err}", RESULTS_LOG_HEADER[4]))?;
    Ok(LatencyRecord {
        op_type: OperationType::new(columns[0].trim()),
        scheduled_ms: int(1)?,
        actual_ms: int(2)?,
        duration_ns: (duration_ms.max(0.0) * 1_000_000.0).round() as u64,
        outcome,
    })
}
