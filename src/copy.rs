//! the COPY data path.
//!
//! [`Copy`] is a scoped resource over an open `COPY ... FROM STDIN` or
//! `COPY ... TO STDOUT` statement: raw chunks through [`Copy::read`] and
//! [`Copy::write`], framed rows through [`Copy::read_row`] and
//! [`Copy::write_row`]. dropping the scope without [`Copy::finish`] aborts an
//! upload so the connection comes back usable.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};

use crate::{
    adapt::ParamFormat,
    cursor::Cursor,
    errors::{Error, InterfaceError, ProgrammingError},
    machine::{CopyEnd, CopyFrom, CopyTo, Execute},
    pq::{ExecStatus, Format},
    rows::BoxValue,
    value::SqlValue,
    waiting,
};

// PGCOPY\n\377\r\n\0
pub(crate) const BINARY_SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

/// an open COPY operation bound to a cursor.
pub struct Copy<'c, 'a> {
    cursor: &'a mut Cursor<'c>,
    direction: Direction,
    format: Format,
    finished: bool,
    // write side
    wrote_signature: bool,
    // read side
    read_buf: BytesMut,
    read_done: bool,
    read_header_skipped: bool,
}

impl<'c, 'a> Copy<'c, 'a> {
    pub(crate) fn start(cursor: &'a mut Cursor<'c>, statement: &str) -> Result<Self, Error> {
        let conn = cursor.conn_ref();
        let mut state = conn.lock();
        conn.start_query(&mut state)?;

        let interval = conn.wait_interval;
        let pgconn = state.pgconn()?;
        pgconn.send_query(statement)?;
        let mut machine = Execute::default();
        let results = waiting::wait(&mut machine, pgconn, interval)?;
        conn.drain_notifies(&mut state);
        drop(state);

        let res = results
            .into_iter()
            .next()
            .ok_or_else(|| crate::errors::InternalError::new("no result after a COPY statement"))?;
        let (direction, format) = match res.status() {
            ExecStatus::CopyIn => (Direction::In, res.copy_format()),
            ExecStatus::CopyOut => (Direction::Out, res.copy_format()),
            ExecStatus::FatalError => return Err(res.into_error()),
            _ => {
                return Err(ProgrammingError::new(
                    "copy() must be used with a COPY ... FROM STDIN or COPY ... TO STDOUT statement",
                )
                .into())
            }
        };

        Ok(Self {
            cursor,
            direction,
            format,
            finished: false,
            wrote_signature: false,
            read_buf: BytesMut::new(),
            read_done: false,
            read_header_skipped: false,
        })
    }

    /// data format of the stream, as the server announced it.
    pub fn format(&self) -> Format {
        self.format
    }

    fn check_direction(&self, wanted: Direction) -> Result<(), Error> {
        if self.direction != wanted {
            let what = match wanted {
                Direction::In => "write on a COPY TO STDOUT",
                Direction::Out => "read on a COPY FROM STDIN",
            };
            return Err(ProgrammingError::new(format!("cannot {what} operation")).into());
        }
        Ok(())
    }

    /// read the next raw chunk of a COPY TO stream. `None` ends the stream.
    pub fn read(&mut self) -> Result<Option<Bytes>, Error> {
        self.check_direction(Direction::Out)?;
        if self.read_done {
            return Ok(None);
        }
        let conn = self.cursor.conn_ref();
        let mut state = conn.lock();
        let interval = conn.wait_interval;
        let pgconn = state.pgconn()?;
        let mut machine = CopyFrom::default();
        let chunk = waiting::wait(&mut machine, pgconn, interval)?;
        conn.drain_notifies(&mut state);
        if chunk.is_none() {
            self.read_done = true;
            self.finished = true;
        }
        Ok(chunk)
    }

    /// feed one raw chunk into a COPY FROM stream.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.check_direction(Direction::In)?;
        self.write_bytes(Bytes::copy_from_slice(data.as_ref()))
    }

    fn write_bytes(&mut self, data: Bytes) -> Result<(), Error> {
        let conn = self.cursor.conn_ref();
        let mut state = conn.lock();
        let interval = conn.wait_interval;
        let pgconn = state.pgconn()?;
        let mut machine = CopyTo::new(data);
        waiting::wait(&mut machine, pgconn, interval)
    }

    /// dump one host row and feed it, framed for the stream's format.
    pub fn write_row(&mut self, row: &[&dyn SqlValue]) -> Result<(), Error> {
        self.check_direction(Direction::In)?;
        let buf = match self.format {
            Format::Text => self.frame_text_row(row)?,
            Format::Binary => {
                let mut buf = Vec::new();
                if !self.wrote_signature {
                    buf.extend_from_slice(BINARY_SIGNATURE);
                    buf.write_i32::<BigEndian>(0)?;
                    buf.write_i32::<BigEndian>(0)?;
                    self.wrote_signature = true;
                }
                self.frame_binary_row(row, &mut buf)?;
                buf
            }
        };
        self.write_bytes(Bytes::from(buf))
    }

    fn frame_text_row(&mut self, row: &[&dyn SqlValue]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(b'\t');
            }
            match value.unwrap_opt() {
                None => out.extend_from_slice(b"\\N"),
                Some(value) => {
                    let tx = self
                        .cursor
                        .transformer_mut()
                        .ok_or_else(|| InterfaceError::new("copy cursor lost its transformer"))?;
                    let dumper = tx.get_dumper(value, ParamFormat::Text)?;
                    let raw = dumper.dump(value)?;
                    escape_copy_text(&raw, &mut out);
                }
            }
        }
        out.push(b'\n');
        Ok(out)
    }

    fn frame_binary_row(&mut self, row: &[&dyn SqlValue], out: &mut Vec<u8>) -> Result<(), Error> {
        out.write_i16::<BigEndian>(row.len() as i16)?;
        for value in row {
            match value.unwrap_opt() {
                None => out.write_i32::<BigEndian>(-1)?,
                Some(value) => {
                    let tx = self
                        .cursor
                        .transformer_mut()
                        .ok_or_else(|| InterfaceError::new("copy cursor lost its transformer"))?;
                    let dumper = tx.get_dumper(value, ParamFormat::Binary)?;
                    let raw = dumper.dump(value)?;
                    out.write_i32::<BigEndian>(raw.len() as i32)?;
                    out.extend_from_slice(&raw);
                }
            }
        }
        Ok(())
    }

    /// read one framed row of a COPY TO stream. cells come back as strings
    /// (text format) or raw bytes (binary format).
    pub fn read_row(&mut self) -> Result<Option<Vec<Option<BoxValue>>>, Error> {
        self.check_direction(Direction::Out)?;
        match self.format {
            Format::Text => self.read_text_row(),
            Format::Binary => self.read_binary_row(),
        }
    }

    fn fill_until<F>(&mut self, mut ready: F) -> Result<bool, Error>
    where
        F: FnMut(&BytesMut) -> bool,
    {
        while !ready(&self.read_buf) {
            if self.read_done {
                return Ok(false);
            }
            match self.read()? {
                Some(chunk) => self.read_buf.extend_from_slice(&chunk),
                None => return Ok(ready(&self.read_buf)),
            }
        }
        Ok(true)
    }

    fn read_text_row(&mut self) -> Result<Option<Vec<Option<BoxValue>>>, Error> {
        if !self.fill_until(|buf| buf.contains(&b'\n'))? && self.read_buf.is_empty() {
            return Ok(None);
        }
        let line_end = match self.read_buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None if !self.read_buf.is_empty() => self.read_buf.len(),
            None => return Ok(None),
        };
        let line = self.read_buf.split_to(line_end);
        if !self.read_buf.is_empty() {
            let _ = self.read_buf.split_to(1); // the newline
        }

        let mut cells = Vec::new();
        for field in split_copy_fields(&line) {
            match field {
                None => cells.push(None),
                Some(raw) => {
                    let loaded = self.load_cell(&raw)?;
                    cells.push(Some(loaded));
                }
            }
        }
        Ok(Some(cells))
    }

    fn read_binary_row(&mut self) -> Result<Option<Vec<Option<BoxValue>>>, Error> {
        if !self.read_header_skipped {
            let header_len = BINARY_SIGNATURE.len() + 8;
            if !self.fill_until(|buf| buf.len() >= header_len)? {
                return Ok(None);
            }
            if &self.read_buf[..BINARY_SIGNATURE.len()] != BINARY_SIGNATURE {
                return Err(InterfaceError::new("bad binary COPY signature").into());
            }
            let mut rest = &self.read_buf[BINARY_SIGNATURE.len()..header_len];
            let _flags = rest.read_i32::<BigEndian>()?;
            let ext_len = rest.read_i32::<BigEndian>()?;
            let skip = header_len + ext_len.max(0) as usize;
            if !self.fill_until(|buf| buf.len() >= skip)? {
                return Err(InterfaceError::new("truncated binary COPY header").into());
            }
            let _ = self.read_buf.split_to(skip);
            self.read_header_skipped = true;
        }

        if !self.fill_until(|buf| buf.len() >= 2)? {
            return Ok(None);
        }
        let nfields = (&self.read_buf[..2]).read_i16::<BigEndian>()?;
        let _ = self.read_buf.split_to(2);
        if nfields < 0 {
            // the trailer; nothing follows but the end of the stream
            return Ok(None);
        }

        let mut cells = Vec::with_capacity(nfields as usize);
        for _ in 0..nfields {
            if !self.fill_until(|buf| buf.len() >= 4)? {
                return Err(InterfaceError::new("truncated binary COPY row").into());
            }
            let len = (&self.read_buf[..4]).read_i32::<BigEndian>()?;
            let _ = self.read_buf.split_to(4);
            if len < 0 {
                cells.push(None);
                continue;
            }
            let len = len as usize;
            if !self.fill_until(|buf| buf.len() >= len)? {
                return Err(InterfaceError::new("truncated binary COPY row").into());
            }
            let raw = self.read_buf.split_to(len);
            cells.push(Some(self.load_cell(&raw)?));
        }
        Ok(Some(cells))
    }

    fn load_cell(&mut self, raw: &[u8]) -> Result<BoxValue, Error> {
        let format = self.format;
        let tx = self
            .cursor
            .transformer_mut()
            .ok_or_else(|| InterfaceError::new("copy cursor lost its transformer"))?;
        // COPY describes no columns, so cells go through the unknown loader
        let loader = tx.get_loader(crate::oids::INVALID_OID, format)?;
        loader.load(raw)
    }

    /// complete the operation: terminate an upload (with the binary trailer
    /// when due) or drain a download, and collect the final server result.
    pub fn finish(mut self) -> Result<(), Error> {
        match self.direction {
            Direction::In => {
                if self.format == Format::Binary && self.wrote_signature {
                    let mut trailer = Vec::with_capacity(2);
                    trailer.write_i16::<BigEndian>(-1)?;
                    self.write_bytes(Bytes::from(trailer))?;
                }
                self.end_copy(None)?;
            }
            Direction::Out => {
                while self.read()?.is_some() {}
            }
        }
        self.finished = true;
        Ok(())
    }

    fn end_copy(&mut self, error: Option<String>) -> Result<(), Error> {
        let conn = self.cursor.conn_ref();
        let mut state = conn.lock();
        let interval = conn.wait_interval;
        let pgconn = state.pgconn()?;
        let mut machine = CopyEnd::new(error);
        waiting::wait(&mut machine, pgconn, interval)?;
        conn.drain_notifies(&mut state);
        Ok(())
    }
}

impl Drop for Copy<'_, '_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // leaving the scope abnormally: abort an upload with an error message
        // so the server discards the partial data, drain a download
        match self.direction {
            Direction::In => {
                let _ = self.end_copy(Some("error while writing COPY data".to_string()));
            }
            Direction::Out => while let Ok(Some(_)) = self.read() {},
        }
    }
}

pub(crate) fn escape_copy_text(raw: &[u8], out: &mut Vec<u8>) {
    for &b in raw {
        match b {
            0x08 => out.extend_from_slice(b"\\b"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            0x0b => out.extend_from_slice(b"\\v"),
            0x0c => out.extend_from_slice(b"\\f"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b => out.push(b),
        }
    }
}

pub(crate) fn split_copy_fields(line: &[u8]) -> Vec<Option<Vec<u8>>> {
    let mut fields = Vec::new();
    let mut current = Vec::new();
    let mut is_null = false;
    let mut i = 0;

    while i <= line.len() {
        match line.get(i) {
            Some(b'\t') | None => {
                let cell = if is_null && current.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut current))
                };
                fields.push(cell);
                is_null = false;
                i += 1;
            }
            Some(b'\\') => {
                match line.get(i + 1) {
                    Some(b'N') if current.is_empty() => is_null = true,
                    Some(b'b') => current.push(0x08),
                    Some(b't') => current.push(b'\t'),
                    Some(b'n') => current.push(b'\n'),
                    Some(b'v') => current.push(0x0b),
                    Some(b'f') => current.push(0x0c),
                    Some(b'r') => current.push(b'\r'),
                    Some(b'\\') => current.push(b'\\'),
                    Some(&other) => current.push(other),
                    None => {}
                }
                i += 2;
            }
            Some(&b) => {
                current.push(b);
                i += 1;
            }
        }
    }
    fields
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn copy_text_escaping() {
        let mut out = Vec::new();
        escape_copy_text(b"a\tb\nc\\d", &mut out);
        assert_eq!(&out, b"a\\tb\\nc\\\\d");
    }

    #[test]
    fn copy_text_field_split() {
        let fields = split_copy_fields(b"one\ttwo\\tthree\t\\N\t");
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].as_deref(), Some(&b"one"[..]));
        assert_eq!(fields[1].as_deref(), Some(&b"two\tthree"[..]));
        assert_eq!(fields[2], None);
        // an empty (non NULL) trailing field
        assert_eq!(fields[3].as_deref(), Some(&b""[..]));
    }

    #[test]
    fn binary_signature_shape() {
        assert_eq!(BINARY_SIGNATURE.len(), 11);
        assert!(BINARY_SIGNATURE.starts_with(b"PGCOPY\n"));
    }
}
