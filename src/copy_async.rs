//! the COPY data path for the cooperative connection.
//!
//! the async counterpart of [`Copy`], sharing its framing. dropping the
//! scope cannot abort the stream (no awaiting in `Drop`); an unfinished
//! upload is aborted lazily by the next operation failing, and
//! [`AsyncCopy::abort`] exists for explicit cleanup.
//!
//! [`Copy`]: crate::copy::Copy

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::{
    adapt::ParamFormat,
    copy::{escape_copy_text, split_copy_fields, BINARY_SIGNATURE},
    cursor_async::AsyncCursor,
    errors::{Error, InterfaceError, ProgrammingError},
    machine::{CopyEnd, CopyFrom, CopyTo, Execute},
    pq::{ExecStatus, Format},
    rows::BoxValue,
    value::SqlValue,
    waiting,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

/// an open COPY operation bound to an async cursor.
pub struct AsyncCopy<'c, 'a> {
    cursor: &'a mut AsyncCursor<'c>,
    direction: Direction,
    format: Format,
    finished: bool,
    wrote_signature: bool,
    read_buf: BytesMut,
    read_done: bool,
    read_header_skipped: bool,
}

impl<'c, 'a> AsyncCopy<'c, 'a> {
    pub(crate) async fn start(cursor: &'a mut AsyncCursor<'c>, statement: &str) -> Result<AsyncCopy<'c, 'a>, Error> {
        let conn = cursor.conn_ref();
        let mut state = conn.lock().await;
        conn.start_query(&mut state).await?;

        let pgconn = state.pgconn()?;
        pgconn.send_query(statement)?;
        let mut machine = Execute::default();
        let results = waiting::wait_async(&mut machine, pgconn).await?;
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

        Ok(AsyncCopy {
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
    pub async fn read(&mut self) -> Result<Option<Bytes>, Error> {
        self.check_direction(Direction::Out)?;
        if self.read_done {
            return Ok(None);
        }
        let conn = self.cursor.conn_ref();
        let mut state = conn.lock().await;
        let pgconn = state.pgconn()?;
        let mut machine = CopyFrom::default();
        let chunk = waiting::wait_async(&mut machine, pgconn).await?;
        conn.drain_notifies(&mut state);
        if chunk.is_none() {
            self.read_done = true;
            self.finished = true;
        }
        Ok(chunk)
    }

    /// feed one raw chunk into a COPY FROM stream.
    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.check_direction(Direction::In)?;
        self.write_bytes(Bytes::copy_from_slice(data.as_ref())).await
    }

    async fn write_bytes(&mut self, data: Bytes) -> Result<(), Error> {
        let conn = self.cursor.conn_ref();
        let mut state = conn.lock().await;
        let pgconn = state.pgconn()?;
        let mut machine = CopyTo::new(data);
        waiting::wait_async(&mut machine, pgconn).await
    }

    /// dump one host row and feed it, framed for the stream's format.
    pub async fn write_row(&mut self, row: &[&dyn SqlValue]) -> Result<(), Error> {
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
        self.write_bytes(Bytes::from(buf)).await
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

    /// read one framed row of a COPY TO stream.
    pub async fn read_row(&mut self) -> Result<Option<Vec<Option<BoxValue>>>, Error> {
        self.check_direction(Direction::Out)?;
        match self.format {
            Format::Text => self.read_text_row().await,
            Format::Binary => self.read_binary_row().await,
        }
    }

    async fn fill_until_len(&mut self, len: usize) -> Result<bool, Error> {
        while self.read_buf.len() < len {
            if self.read_done {
                return Ok(false);
            }
            match self.read().await? {
                Some(chunk) => self.read_buf.extend_from_slice(&chunk),
                None => return Ok(self.read_buf.len() >= len),
            }
        }
        Ok(true)
    }

    async fn read_text_row(&mut self) -> Result<Option<Vec<Option<BoxValue>>>, Error> {
        while !self.read_buf.contains(&b'\n') {
            if self.read_done {
                break;
            }
            match self.read().await? {
                Some(chunk) => self.read_buf.extend_from_slice(&chunk),
                None => break,
            }
        }
        if self.read_buf.is_empty() {
            return Ok(None);
        }
        let line_end = self
            .read_buf
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(self.read_buf.len());
        let line = self.read_buf.split_to(line_end);
        if !self.read_buf.is_empty() {
            let _ = self.read_buf.split_to(1);
        }

        let mut cells = Vec::new();
        for field in split_copy_fields(&line) {
            match field {
                None => cells.push(None),
                Some(raw) => cells.push(Some(self.load_cell(&raw)?)),
            }
        }
        Ok(Some(cells))
    }

    async fn read_binary_row(&mut self) -> Result<Option<Vec<Option<BoxValue>>>, Error> {
        if !self.read_header_skipped {
            let header_len = BINARY_SIGNATURE.len() + 8;
            if !self.fill_until_len(header_len).await? {
                return Ok(None);
            }
            if &self.read_buf[..BINARY_SIGNATURE.len()] != BINARY_SIGNATURE {
                return Err(InterfaceError::new("bad binary COPY signature").into());
            }
            let mut rest = &self.read_buf[BINARY_SIGNATURE.len()..header_len];
            let _flags = rest.read_i32::<BigEndian>()?;
            let ext_len = rest.read_i32::<BigEndian>()?;
            let skip = header_len + ext_len.max(0) as usize;
            if !self.fill_until_len(skip).await? {
                return Err(InterfaceError::new("truncated binary COPY header").into());
            }
            let _ = self.read_buf.split_to(skip);
            self.read_header_skipped = true;
        }

        if !self.fill_until_len(2).await? {
            return Ok(None);
        }
        let nfields = (&self.read_buf[..2]).read_i16::<BigEndian>()?;
        let _ = self.read_buf.split_to(2);
        if nfields < 0 {
            return Ok(None);
        }

        let mut cells = Vec::with_capacity(nfields as usize);
        for _ in 0..nfields {
            if !self.fill_until_len(4).await? {
                return Err(InterfaceError::new("truncated binary COPY row").into());
            }
            let len = (&self.read_buf[..4]).read_i32::<BigEndian>()?;
            let _ = self.read_buf.split_to(4);
            if len < 0 {
                cells.push(None);
                continue;
            }
            let len = len as usize;
            if !self.fill_until_len(len).await? {
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
        let loader = tx.get_loader(crate::oids::INVALID_OID, format)?;
        loader.load(raw)
    }

    /// complete the operation.
    pub async fn finish(mut self) -> Result<(), Error> {
        match self.direction {
            Direction::In => {
                if self.format == Format::Binary && self.wrote_signature {
                    let mut trailer = Vec::with_capacity(2);
                    trailer.write_i16::<BigEndian>(-1)?;
                    self.write_bytes(Bytes::from(trailer)).await?;
                }
                self.end_copy(None).await?;
            }
            Direction::Out => {
                while self.read().await?.is_some() {}
            }
        }
        self.finished = true;
        Ok(())
    }

    /// abort an upload, telling the server to discard the partial data.
    pub async fn abort(mut self, message: &str) -> Result<(), Error> {
        if self.direction == Direction::In {
            self.end_copy(Some(message.to_string())).await?;
        } else {
            while self.read().await?.is_some() {}
        }
        self.finished = true;
        Ok(())
    }

    async fn end_copy(&mut self, error: Option<String>) -> Result<(), Error> {
        let conn = self.cursor.conn_ref();
        let mut state = conn.lock().await;
        let pgconn = state.pgconn()?;
        let mut machine = CopyEnd::new(error);
        waiting::wait_async(&mut machine, pgconn).await?;
        conn.drain_notifies(&mut state);
        Ok(())
    }
}

impl Drop for AsyncCopy<'_, '_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "async COPY dropped without finish() or abort(); \
                 the stream stays open until the connection errors or resets"
            );
        }
    }
}
