//! Line protocol connection.
//!
//! One request per line: `method arg...`. Arguments are words; `true` /
//! `false`, integers and decimals are converted, anything else is a
//! string. Replies are `ok <value>` or `fault <code> <message>`.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{FromRawFd, RawFd};

use rpcd_core::{Fault, MethodRegistry, Value};
use rpcd_server::{Context, EventMask, Interest, Source};

const READ_CHUNK: usize = 4096;
const MAX_LINE: usize = 64 * 1024;

fn parse_arg(word: &str) -> Value {
    match word {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(i) = word.parse::<i32>() {
                Value::Int(i)
            } else if word.contains('.') {
                word.parse::<f64>()
                    .map(Value::Double)
                    .unwrap_or_else(|_| Value::from(word))
            } else {
                Value::from(word)
            }
        }
    }
}

/// Execute one request line. `None` for blank lines.
pub fn call(methods: &MethodRegistry, line: &str) -> Option<Result<Value, Fault>> {
    let mut words = line.split_whitespace();
    let name = words.next()?;
    let params: Value = words.map(parse_arg).collect();

    Some(match methods.find_method(name) {
        Some(method) => method.execute(&params),
        None => Err(Fault::method_not_found(format!("{}: unknown method", name))),
    })
}

pub fn format_reply(result: &Result<Value, Fault>) -> String {
    match result {
        Ok(value) => format!("ok {}\n", value),
        Err(fault) => format!("fault {} {}\n", fault.code, fault.message),
    }
}

/// A client connection. Owns the descriptor; dropping it closes the socket.
pub struct LineConnection {
    fd: RawFd,
    stream: TcpStream,
    methods: MethodRegistry,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    /// Client half-closed; only pending replies remain.
    read_closed: bool,
}

impl LineConnection {
    pub fn new(fd: RawFd, methods: MethodRegistry) -> Self {
        // The acceptor hands over sole ownership of a connected socket
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        Self {
            fd,
            stream,
            methods,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            read_closed: false,
        }
    }

    /// Read what is available, stopping once more than `MAX_LINE` bytes are
    /// buffered. `Ok(false)` on end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.inbuf.len() <= MAX_LINE {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn respond(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        if let Some(result) = call(&self.methods, text.trim()) {
            if let Err(fault) = &result {
                tracing::debug!(fd = self.fd, code = fault.code, "call faulted");
            }
            self.outbuf.extend_from_slice(format_reply(&result).as_bytes());
        }
    }

    /// Answer every complete line. At end of stream an unterminated last
    /// line counts as complete.
    fn process(&mut self) {
        while let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.inbuf.drain(..=pos).collect();
            self.respond(&line);
        }
        if self.read_closed && !self.inbuf.is_empty() {
            let line = std::mem::take(&mut self.inbuf);
            self.respond(&line);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.outbuf.is_empty() {
            match self.stream.write(&self.outbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Source for LineConnection {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn handle_event(&mut self, ready: EventMask, cx: &mut Context<'_>) -> Interest {
        if !self.read_closed && ready.intersects(EventMask::READABLE | EventMask::EXCEPTION) {
            match self.fill() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(fd = self.fd, "client closed its write side");
                    self.read_closed = true;
                }
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "read failed");
                    return Interest::StopMonitoring;
                }
            }
            self.process();
            if self.inbuf.len() > MAX_LINE {
                tracing::warn!(fd = self.fd, "request line too long, closing");
                return Interest::StopMonitoring;
            }
        }

        if let Err(e) = self.flush() {
            tracing::debug!(fd = self.fd, error = %e, "write failed");
            return Interest::StopMonitoring;
        }

        match (self.read_closed, self.outbuf.is_empty()) {
            (true, true) => {
                tracing::debug!(fd = self.fd, "connection done");
                Interest::StopMonitoring
            }
            (true, false) => {
                cx.set_mask(EventMask::WRITABLE);
                Interest::ContinueMonitoring
            }
            (false, true) => {
                cx.set_mask(EventMask::READABLE);
                Interest::ContinueMonitoring
            }
            (false, false) => {
                cx.set_mask(EventMask::READABLE | EventMask::WRITABLE);
                Interest::ContinueMonitoring
            }
        }
    }
}
