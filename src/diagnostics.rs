use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use crate::error::Result;




/**
 * Tab-separated diagnostics tables, one file per table name, written by rank
 * 0 only. A header line is written when a table is first opened. Writes are
 * buffered; call [`Diagnostics::flush`] at checkpoints.
 */
pub struct Diagnostics {
    directory: Option<PathBuf>,
    tables: HashMap<String, BufWriter<File>>,
}




// ============================================================================
impl Diagnostics {


    /**
     * Diagnostics written into `directory` if `rank` is 0, and discarded on
     * every other rank.
     */
    pub fn new(directory: PathBuf, rank: usize) -> Self {
        Self {
            directory: if rank == 0 { Some(directory) } else { None },
            tables: HashMap::new(),
        }
    }


    /**
     * Diagnostics that are never written.
     */
    pub fn disabled() -> Self {
        Self { directory: None, tables: HashMap::new() }
    }


    pub fn is_enabled(&self) -> bool {
        self.directory.is_some()
    }


    /**
     * Append one row to the named table: the step number followed by the
     * values in scientific notation.
     */
    pub fn write_row(&mut self, table: &str, header: &[&str], step: u64, values: &[f64]) -> Result<()> {
        let directory = match &self.directory {
            Some(directory) => directory,
            None => return Ok(()),
        };

        if !self.tables.contains_key(table) {
            fs::create_dir_all(directory)?;
            let mut file = BufWriter::new(File::create(directory.join(table))?);
            writeln!(file, "step\t{}", header.join("\t"))?;
            self.tables.insert(table.to_string(), file);
        }

        if let Some(file) = self.tables.get_mut(table) {
            write!(file, "{}", step)?;
            for value in values {
                write!(file, "\t{:.8e}", value)?;
            }
            writeln!(file)?;
        }
        Ok(())
    }


    pub fn flush(&mut self) -> Result<()> {
        for file in self.tables.values_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl Drop for Diagnostics {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
