//! Scripted in-memory port for tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;
use crate::protocol::isp::Request;
use crate::protocol::slip;

/// DTR/RTS levels at the time a request was written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Lines {
    pub dtr: bool,
    pub rts: bool,
}

type Responder = Box<dyn FnMut(&Request, Lines) -> Vec<u8> + Send>;

/// Response payload `[op, reason]`.
pub(crate) fn reply(op: u8, reason: u8) -> Vec<u8> {
    vec![op, reason]
}

pub(crate) struct MockPort {
    responder: Responder,
    decoder: slip::Decoder,
    rx: VecDeque<u8>,
    requests: Vec<Request>,
    lines: Lines,
    line_log: Vec<Lines>,
    baud_log: Vec<u32>,
    baud: u32,
    timeout: Duration,
    closed: bool,
}

impl MockPort {
    /// Each request is answered with zero or more payloads, SLIP framed.
    pub fn new<F>(mut responder: F) -> Self
    where
        F: FnMut(&Request) -> Vec<Vec<u8>> + Send + 'static,
    {
        Self::with_line_responder(move |request, _| responder(request))
    }

    /// Like [`MockPort::new`] but the responder also sees DTR/RTS.
    pub fn with_line_responder<F>(mut responder: F) -> Self
    where
        F: FnMut(&Request, Lines) -> Vec<Vec<u8>> + Send + 'static,
    {
        Self::build(Box::new(move |request, lines| {
            responder(request, lines)
                .iter()
                .flat_map(|payload| slip::encode(payload))
                .collect()
        }))
    }

    /// The responder returns raw bytes, delimiters included.
    pub fn with_raw_responder<F>(mut responder: F) -> Self
    where
        F: FnMut(&Request) -> Vec<u8> + Send + 'static,
    {
        Self::build(Box::new(move |request, _| responder(request)))
    }

    fn build(responder: Responder) -> Self {
        Self {
            responder,
            decoder: slip::Decoder::new(),
            rx: VecDeque::new(),
            requests: Vec::new(),
            lines: Lines::default(),
            line_log: Vec::new(),
            baud_log: Vec::new(),
            baud: 115200,
            timeout: Duration::from_millis(1),
            closed: false,
        }
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn line_log(&self) -> &[Lines] {
        &self.line_log
    }

    pub fn baud_log(&self) -> &[u32] {
        &self.baud_log
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn record_lines(&mut self) {
        self.line_log.push(self.lines);
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock: no data"));
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            let frame = self
                .decoder
                .push(byte)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if let Some(body) = frame {
                let request = Request::parse(&body)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                let response = (self.responder)(&request, self.lines);
                self.rx.extend(response);
                self.requests.push(request);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud = baud_rate;
        self.baud_log.push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines.dtr = level;
        self.record_lines();
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lines.rts = level;
        self.record_lines();
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
