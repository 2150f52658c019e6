use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::Path,
    sync::{Arc, Mutex},
};

// Simple ANSI stripper to prevent the log file from being polluted with escape sequences
pub fn strip_ansi_escapes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c.is_ascii_alphabetic() {
                in_escape = false;
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Appends to a log file and periodically rewrites it, keeping only the
/// newest `max_lines` lines.
#[derive(Clone)]
pub(crate) struct TailFileWriter {
    path: String,
    max_lines: u32,
    lines_since_prune: Arc<Mutex<u32>>,
}

impl TailFileWriter {
    pub fn new(path: String, max_lines: u32) -> Self {
        Self {
            path,
            max_lines,
            lines_since_prune: Arc::new(Mutex::new(0)),
        }
    }

    fn prune(&self) -> io::Result<()> {
        if !Path::new(&self.path).exists() {
            return Ok(());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;

        if lines.len() > self.max_lines as usize {
            let tail = lines.split_off(lines.len() - self.max_lines as usize);
            let mut file = File::create(&self.path)?;
            for line in &tail {
                writeln!(file, "{}", line)?;
            }
        }
        Ok(())
    }
}

impl io::Write for TailFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.write_all(buf)?;

        let new_lines = buf.iter().filter(|&&b| b == b'\n').count() as u32;
        let due = {
            let mut pending = self
                .lines_since_prune
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *pending += new_lines;
            // Rewriting the file on every line would thrash; prune after
            // 10% of the cap (at least 50 lines) has accumulated.
            let threshold = (self.max_lines / 10).max(50);
            if *pending >= threshold {
                *pending = 0;
                true
            } else {
                false
            }
        };

        if due {
            if let Err(e) = self.prune() {
                eprintln!("Failed to prune log file: {}", e);
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for TailFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
