// Trial report writers

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::batch::SweepPoint;
use crate::simulation::TrialReport;

/// Trait for output handlers
pub trait OutputHandler {
    /// Handle a completed trial
    fn handle_report(&mut self, report: &TrialReport) -> io::Result<()>;

    /// Flush buffered output
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Human-readable single-event report
pub struct ConsoleOutput<W: Write> {
    writer: W,
}

impl ConsoleOutput<io::Stdout> {
    pub fn stdout() -> Self {
        ConsoleOutput {
            writer: io::stdout(),
        }
    }
}

impl<W: Write> ConsoleOutput<W> {
    pub fn new(writer: W) -> Self {
        ConsoleOutput { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn format_point(p: &[f64; 3]) -> String {
    format!("[{:.2}, {:.2}, {:.2}]", p[0], p[1], p[2])
}

impl<W: Write> OutputHandler for ConsoleOutput<W> {
    fn handle_report(&mut self, report: &TrialReport) -> io::Result<()> {
        let w = &mut self.writer;
        // Stations are numbered from 1 for display
        writeln!(w, "First station to receive earthquake signal: Station {}", report.reference + 1)?;
        writeln!(w, "Station Arrival Times:")?;
        for (i, arrival) in report.arrivals.iter().enumerate() {
            writeln!(w, "  Station {}: {}", i + 1, arrival)?;
        }
        writeln!(w)?;
        writeln!(w, "True Earthquake Location:  {}", format_point(&report.true_source))?;
        writeln!(w, "Estimated Location:        {}", format_point(&report.estimate))?;
        writeln!(w, "Error (m):                 {:.3}", report.error)?;
        if let Some(sigma) = report.position_error {
            writeln!(w, "1-sigma uncertainty (m):   {:.3}", sigma)?;
        }
        writeln!(
            w,
            "Solver: {} after {} iterations ({:?}), residual norm {:.3e} s",
            if report.converged { "converged" } else { "NOT converged" },
            report.iterations,
            report.termination,
            report.residual_norm
        )?;
        w.flush()
    }
}

/// CSV format output, one row per trial
pub struct CsvOutput {
    writer: BufWriter<File>,
}

pub const CSV_HEADER: &str =
    "trial,seed,noise_std,reference,true_x,true_y,true_z,est_x,est_y,est_z,error_m,converged,iterations,residual_norm";

impl CsvOutput {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", CSV_HEADER)?;
        Ok(CsvOutput { writer })
    }

    pub fn format_row(report: &TrialReport) -> String {
        format!(
            "{},{},{},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{},{},{:.6e}",
            report.trial,
            report.seed,
            report.noise_std,
            report.reference,
            report.true_source[0],
            report.true_source[1],
            report.true_source[2],
            report.estimate[0],
            report.estimate[1],
            report.estimate[2],
            report.error,
            report.converged,
            report.iterations,
            report.residual_norm
        )
    }
}

impl OutputHandler for CsvOutput {
    fn handle_report(&mut self, report: &TrialReport) -> io::Result<()> {
        writeln!(self.writer, "{}", Self::format_row(report))
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// JSON lines output, one object per trial
pub struct JsonOutput {
    writer: BufWriter<File>,
}

impl JsonOutput {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(JsonOutput {
            writer: BufWriter::new(file),
        })
    }
}

impl OutputHandler for JsonOutput {
    fn handle_report(&mut self, report: &TrialReport) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, report)?;
        writeln!(self.writer)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Noise sweep table
pub fn write_sweep_table<W: Write>(mut w: W, points: &[SweepPoint]) -> io::Result<()> {
    writeln!(w, "{:>10} {:>8} {:>10} {:>14} {:>14} {:>14}", "noise_s", "trials", "converged", "mean_err_m", "rms_err_m", "max_err_m")?;
    for p in points {
        writeln!(
            w,
            "{:>10.4} {:>8} {:>10} {:>14.3} {:>14.3} {:>14.3}",
            p.noise_std, p.trials, p.converged, p.mean_error, p.rms_error, p.max_error
        )?;
    }
    w.flush()
}
