//! a scripted in-process server speaking just enough of the wire protocol to
//! drive the client end to end without a real database.
//!
//! every accepted connection gets the startup exchange for free; after that,
//! each request batch (a simple query, or an extended batch closed by Sync)
//! consumes the next canned response from the script, cycling when the
//! script runs out.

#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
};

pub struct FakeServer {
    pub conninfo: String,
}

impl FakeServer {
    /// start a server whose connections answer request batches with the given
    /// responses, in order, cycling at the end.
    pub fn spawn(script: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let port = listener.local_addr().expect("local addr").port();
        let script = Arc::new(script);

        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let script = script.clone();
                thread::spawn(move || {
                    let _ = serve_connection(stream, &script);
                });
            }
        });

        Self {
            conninfo: format!("host=127.0.0.1 port={port} user=test dbname=test"),
        }
    }
}

fn serve_connection(mut stream: TcpStream, script: &[Vec<u8>]) -> std::io::Result<()> {
    // startup message: i32 length, i32 protocol, parameters
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload)?;

    let mut greeting = Vec::new();
    greeting.extend_from_slice(&auth_ok());
    greeting.extend_from_slice(&parameter_status("server_version", "16.0"));
    greeting.extend_from_slice(&parameter_status("client_encoding", "UTF8"));
    greeting.extend_from_slice(&parameter_status("DateStyle", "ISO, MDY"));
    greeting.extend_from_slice(&parameter_status("TimeZone", "UTC"));
    greeting.extend_from_slice(&backend_key_data(4242, 1717));
    greeting.extend_from_slice(&ready_for_query(b'I'));
    stream.write_all(&greeting)?;

    let mut next_response = 0usize;
    loop {
        let mut tag = [0u8; 1];
        if stream.read_exact(&mut tag).is_err() {
            return Ok(());
        }
        let mut len = [0u8; 4];
        stream.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        let mut body = vec![0u8; len - 4];
        stream.read_exact(&mut body)?;

        match tag[0] {
            // a simple query or a Sync closing an extended batch: reply
            b'Q' | b'S' => {
                let response = &script[next_response % script.len()];
                next_response += 1;
                stream.write_all(response)?;
            }
            // terminate
            b'X' => return Ok(()),
            // parse/bind/describe/execute and copy chatter: buffered until Sync
            _ => {}
        }
    }
}

fn message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&((body.len() as u32 + 4).to_be_bytes()));
    out.extend_from_slice(body);
    out
}

pub fn auth_ok() -> Vec<u8> {
    message(b'R', &0i32.to_be_bytes())
}

pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    message(b'S', &body)
}

pub fn backend_key_data(pid: i32, key: i32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&pid.to_be_bytes());
    body.extend_from_slice(&key.to_be_bytes());
    message(b'K', &body)
}

pub fn ready_for_query(status: u8) -> Vec<u8> {
    message(b'Z', &[status])
}

pub fn parse_complete() -> Vec<u8> {
    message(b'1', &[])
}

pub fn bind_complete() -> Vec<u8> {
    message(b'2', &[])
}

/// a column of the given name and type oid, in text format.
pub fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for (name, oid) in columns {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_be_bytes()); // table oid
        body.extend_from_slice(&0i16.to_be_bytes()); // column id
        body.extend_from_slice(&oid.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes()); // type size
        body.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        body.extend_from_slice(&0i16.to_be_bytes()); // text format
    }
    message(b'T', &body)
}

pub fn data_row(cells: &[Option<&str>]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(cells.len() as i16).to_be_bytes());
    for cell in cells {
        match cell {
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(value) => {
                body.extend_from_slice(&(value.len() as i32).to_be_bytes());
                body.extend_from_slice(value.as_bytes());
            }
        }
    }
    message(b'D', &body)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(tag.as_bytes());
    body.push(0);
    message(b'C', &body)
}

pub fn error_response(sqlstate: &str, text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', "ERROR"), (b'C', sqlstate), (b'M', text)] {
        body.push(field);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    message(b'E', &body)
}

/// response to a parameterless simple query returning the given rows.
pub fn simple_rows(columns: &[(&str, u32)], rows: &[&[Option<&str>]], tag: &str) -> Vec<u8> {
    let mut out = row_description(columns);
    for row in rows {
        out.extend_from_slice(&data_row(row));
    }
    out.extend_from_slice(&command_complete(tag));
    out.extend_from_slice(&ready_for_query(b'I'));
    out
}

/// response to an extended protocol batch returning the given rows.
pub fn extended_rows(columns: &[(&str, u32)], rows: &[&[Option<&str>]], tag: &str) -> Vec<u8> {
    let mut out = parse_complete();
    out.extend_from_slice(&bind_complete());
    out.extend_from_slice(&row_description(columns));
    for row in rows {
        out.extend_from_slice(&data_row(row));
    }
    out.extend_from_slice(&command_complete(tag));
    out.extend_from_slice(&ready_for_query(b'I'));
    out
}

/// response to a command with no rows, with the transaction status to report.
pub fn simple_command(tag: &str, status: u8) -> Vec<u8> {
    let mut out = command_complete(tag);
    out.extend_from_slice(&ready_for_query(status));
    out
}
