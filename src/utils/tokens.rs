use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use flate2::read::GzDecoder;

use crate::error::{PhantomError, PhantomResult};

/// Largest capacity `next_n` reserves before any value is read.
const MAX_PRESIZE: usize = 4096;

/// Whitespace-delimited token stream over a text input.
///
/// All phantom inputs are free-format: values may be split across lines in
/// any way, so readers pull tokens rather than lines. Files whose name ends
/// in `.gz` are decompressed on the fly.
pub struct TokenReader {
    source: PathBuf,
    reader: Box<dyn BufRead + Send>,
    pending: VecDeque<String>,
    line: String,
}

impl TokenReader {
    /// Opens `path`, decompressing `.gz` files.
    pub fn open(path: &Path) -> PhantomResult<Self> {
        let file = File::open(path).map_err(|source| PhantomError::FileNotFound {
            path: path.to_path_buf(),
            source,
        })?;

        let reader: Box<dyn BufRead + Send> = if is_gzip(path) {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        Ok(TokenReader {
            source: path.to_path_buf(),
            reader,
            pending: VecDeque::new(),
            line: String::new(),
        })
    }

    /// Wraps an arbitrary stream; `label` is used in error messages.
    pub fn from_reader(label: impl Into<PathBuf>, reader: impl Read + Send + 'static) -> Self {
        TokenReader {
            source: label.into(),
            reader: Box::new(BufReader::new(reader)),
            pending: VecDeque::new(),
            line: String::new(),
        }
    }

    /// File or label used in error messages.
    pub fn path(&self) -> &Path {
        &self.source
    }

    /// Next raw token, or `None` at end of input.
    pub fn next_token(&mut self) -> PhantomResult<Option<String>> {
        while self.pending.is_empty() {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| PhantomError::io(&self.source, e))?;
            if read == 0 {
                return Ok(None);
            }
            self.pending
                .extend(self.line.split_whitespace().map(str::to_owned));
        }
        Ok(self.pending.pop_front())
    }

    /// Parses the next token as `T`; end of input is an error.
    pub fn next<T>(&mut self, field: &str) -> PhantomResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.try_next(field)? {
            Some(value) => Ok(value),
            None => Err(PhantomError::parse(
                &self.source,
                field,
                "unexpected end of file",
            )),
        }
    }

    /// Parses the next token as `T`, or returns `None` at end of input.
    pub fn try_next<T>(&mut self, field: &str) -> PhantomResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(token) = self.next_token()? else {
            return Ok(None);
        };
        token
            .parse::<T>()
            .map(Some)
            .map_err(|e| PhantomError::parse(&self.source, field, format!("'{token}': {e}")))
    }

    /// Reads `count` values of `T`. `count` usually comes from the file
    /// itself, so only a bounded capacity is reserved up front.
    pub fn next_n<T>(&mut self, count: usize, field: &str) -> PhantomResult<Vec<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let mut values = Vec::with_capacity(count.min(MAX_PRESIZE));
        for _ in 0..count {
            values.push(self.next(field)?);
        }
        Ok(values)
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}
