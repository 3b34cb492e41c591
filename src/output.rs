use crate::telemetry::Reading;
use csv_core::WriteResult;
use std::io::Write as _;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write the results to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not format the record as CSV")]
    SerializeCsv,
}

/// Columns of [`Output::reading`] rows.
pub const READING_HEADERS: &[&str] = &["Name", "Address", "Value"];

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match self.format {
            Format::Table => Formatter::Table { comfy: new_table(), rows: 0, printed: false },
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv,
        };
        Ok(Output { destination: self.output, io, formatter })
    }
}

fn new_table() -> comfy_table::Table {
    let mut comfy = comfy_table::Table::new();
    comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    comfy
}

pub struct Output {
    destination: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv,
    /// `rows` counts rows not yet printed, `printed` whether [`Output::flush`] printed any.
    Table { comfy: comfy_table::Table, rows: usize, printed: bool },
    Jsonl,
}

impl Output {
    pub fn table_headers(&mut self, hdrs: &[&str]) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv => self.write_csv_row(hdrs)?,
            Formatter::Table { comfy, .. } => {
                comfy.set_header(hdrs.iter().copied());
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let max_len = 2 + 2 * values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (index, value) in values.iter().enumerate() {
            if index != 0 {
                let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut output) else {
                    return Err(Error::SerializeCsv);
                };
                self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
            }
            let (WriteResult::InputEmpty, _, ob) = writer.field(value.as_ref().as_bytes(), &mut output)
            else {
                return Err(Error::SerializeCsv);
            };
            self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut output) else {
            return Err(Error::SerializeCsv);
        };
        self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))
    }

    /// Add a record; `table_row` is used for tables and CSV, `serde_record` for JSON lines.
    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv => {
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy, rows, .. } => {
                comfy.add_row(table_row());
                *rows += 1;
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    /// Add a register reading, laid out as [`READING_HEADERS`].
    pub fn reading(&mut self, reading: &Reading) -> Result<(), Error> {
        self.result(
            || {
                vec![
                    reading.register.name.to_string(),
                    format!("{:#06x}", reading.register.spec.address),
                    reading.display_value(),
                ]
            },
            || reading,
        )
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.destination {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    /// Write out everything added so far.
    ///
    /// Tables are printed and started afresh with the same headers.
    pub fn flush(&mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy, rows, printed } = &mut self.formatter {
            if *rows != 0 {
                let mut fresh = new_table();
                if let Some(header) = comfy.header() {
                    fresh.set_header(header.clone());
                }
                let full = std::mem::replace(comfy, fresh);
                *rows = 0;
                *printed = true;
                writeln!(self.io, "{full}").map_err(|e| self.write_error(e))?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy, rows, printed } = &self.formatter {
            if *rows != 0 || !*printed {
                writeln!(self.io, "{comfy}").map_err(|e| self.write_error(e))?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers;

    fn render(format: Format, name: &str, write: impl FnOnce(&mut Output)) -> String {
        let path = std::env::temp_dir().join(format!("saj-tools-{}-{name}", std::process::id()));
        let args = Args { output: Some(path.clone()), format };
        let mut output = args.to_output().unwrap();
        write(&mut output);
        output.commit().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        contents
    }

    fn readings() -> [Reading; 2] {
        [
            Reading {
                register: &registers::BATTERY_SOC,
                value: Ok(registers::BATTERY_SOC.spec.decode(&[8750])),
            },
            Reading {
                register: &registers::GRID_POWER,
                value: Err(crate::transport::Error::Timeout),
            },
        ]
    }

    #[test]
    fn csv_quotes_fields() {
        let text = render(Format::Csv, "csv", |output| {
            output.table_headers(READING_HEADERS).unwrap();
            output.result(|| vec!["a,b".into(), "c".into()], || ()).unwrap();
            for reading in &readings() {
                output.reading(reading).unwrap();
            }
        });
        assert_eq!(
            text.replace("\r\n", "\n"),
            "Name,Address,Value\n\"a,b\",c\nBATTERY_SOC,0x406f,87.50 %\nGRID_POWER,0x4035,unreadable\n"
        );
    }

    #[test]
    fn jsonl_records() {
        let text = render(Format::Jsonl, "jsonl", |output| {
            output.table_headers(READING_HEADERS).unwrap();
            for reading in &readings() {
                output.reading(reading).unwrap();
            }
        });
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let soc: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(soc["name"], "BATTERY_SOC");
        assert_eq!(soc["value"], 87.5);
        let grid: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(grid["value"].is_null());
        assert_eq!(grid["error"], "the device did not respond in time");
    }

    #[test]
    fn flushed_tables_are_not_repeated() {
        let text = render(Format::Table, "flush", |output| {
            output.table_headers(READING_HEADERS).unwrap();
            for _ in 0..2 {
                for reading in &readings() {
                    output.reading(reading).unwrap();
                }
                output.flush().unwrap();
            }
        });
        assert_eq!(text.matches("BATTERY_SOC").count(), 2);
        assert_eq!(text.matches("Address").count(), 2);
    }

    #[test]
    fn table_has_every_row() {
        let text = render(Format::Table, "table", |output| {
            output.table_headers(READING_HEADERS).unwrap();
            for reading in &readings() {
                output.reading(reading).unwrap();
            }
        });
        assert!(text.contains("BATTERY_SOC"));
        assert!(text.contains("87.50 %"));
        assert!(text.contains("unreadable"));
    }
}
