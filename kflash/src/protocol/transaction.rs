//! Request/response transactions over a [`Port`].
//!
//! Every device interaction goes through [`Transport::call`]: send a SLIP
//! framed request, wait for one framed reply, classify it, and retry with a
//! bounded budget. Sessions only supply the request, a timeout and two
//! predicates.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::isp::{Dialect, ErrorCode, Request, Response};
use crate::protocol::slip;

/// Bounded retry policy shared by every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before giving up.
    pub max_retries: usize,
    /// Pause before re-sending after a failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Per-call parameters.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Name used in logs and errors.
    pub label: &'static str,
    /// Deadline for one reply.
    pub timeout: Duration,
    /// Pause after a busy reply before re-sending.
    pub busy_delay: Duration,
    /// Reopen the port after an I/O error instead of only retrying.
    pub reopen_on_io_error: bool,
}

impl CallOptions {
    /// Options with no busy delay and no reopen.
    pub fn new(label: &'static str, timeout: Duration) -> Self {
        Self {
            label,
            timeout,
            busy_delay: Duration::ZERO,
            reopen_on_io_error: false,
        }
    }

    /// Set the busy delay.
    #[must_use]
    pub fn busy_delay(mut self, delay: Duration) -> Self {
        self.busy_delay = delay;
        self
    }

    /// Reopen the port on I/O errors.
    #[must_use]
    pub fn reopen_on_io_error(mut self) -> Self {
        self.reopen_on_io_error = true;
        self
    }
}

/// Counters from the most recent [`Transport::call`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallReport {
    /// Requests written.
    pub sends: usize,
    /// Attempts counted against the retry budget.
    pub failures: usize,
    /// Busy replies.
    pub busy: usize,
    /// DEBUG_INFO replies.
    pub debug_messages: usize,
}

enum Failure {
    Transport(Error),
    Unexpected(String),
}

/// SLIP transport with the retry engine.
pub struct Transport<P: Port> {
    port: P,
    decoder: slip::Decoder,
    retry: RetryPolicy,
    cancel: Option<Arc<AtomicBool>>,
    last_report: CallReport,
}

impl<P: Port> Transport<P> {
    /// Wrap an open port.
    pub fn new(port: P, retry: RetryPolicy) -> Self {
        Self {
            port,
            decoder: slip::Decoder::new(),
            retry,
            cancel: None,
            last_report: CallReport::default(),
        }
    }

    /// Also stop when `flag` becomes true.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Borrow the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Borrow the port mutably, e.g. for DTR/RTS or baud changes.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Give the port back.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Counters of the last completed or failed call.
    pub fn last_report(&self) -> CallReport {
        self.last_report
    }

    /// Fail with `Cancelled` if the user asked to stop.
    pub fn check_cancelled(&self) -> Result<()> {
        let local = self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed));
        if local || crate::is_interrupted_requested() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Drop buffered input and any half-decoded frame.
    pub fn clear(&mut self) -> Result<()> {
        self.decoder.reset();
        self.port.clear_buffers()
    }

    /// Frame and write a request without waiting for a reply.
    pub fn send(&mut self, request: &Request) -> Result<()> {
        self.check_cancelled()?;
        let frame = slip::encode(&request.build());
        trace!(
            "-> op {:#04x} addr {:#010x} ({} byte frame)",
            request.op(),
            request.address(),
            frame.len()
        );
        self.port.write_all_bytes(&frame)
    }

    /// Read until one complete frame arrives or `timeout` elapses.
    pub fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut byte = [0u8; 1];

        loop {
            if Instant::now() >= deadline {
                self.decoder.reset();
                return Err(Error::Timeout(format!(
                    "no response within {} ms",
                    timeout.as_millis()
                )));
            }

            match self.port.read(&mut byte) {
                Ok(0) => {},
                Ok(_) => {
                    if let Some(frame) = self.decoder.push(byte[0])? {
                        trace!("<- {frame:02x?}");
                        return Ok(frame);
                    }
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send `request` and wait for an accepted reply.
    ///
    /// - `accept` ends the call successfully.
    /// - `busy` flushes, waits `busy_delay` and re-sends. Not counted as a failure.
    /// - DEBUG_INFO replies are logged and the reply is awaited again without re-sending.
    /// - Anything else, including timeouts and malformed frames, is a failure.
    ///   After `max_retries` failures the call fails with `DeviceUnresponsive`
    ///   (transport errors) or `Protocol` (unexpected replies).
    pub fn call<D, A, B>(
        &mut self,
        request: &Request,
        options: &CallOptions,
        accept: A,
        busy: B,
    ) -> Result<Response<D>>
    where
        D: Dialect,
        A: Fn(D, ErrorCode) -> bool,
        B: Fn(D, ErrorCode) -> bool,
    {
        let mut report = CallReport::default();
        let mut resend = true;

        let result = loop {
            let outcome = self.exchange::<D>(request, options.timeout, resend, &mut report);
            resend = true;

            let failure = match outcome {
                Ok(response) if response.op.is_debug_info() => {
                    info!("[device] {}", response.message());
                    report.debug_messages += 1;
                    resend = false;
                    continue;
                },
                Ok(response) if accept(response.op, response.reason) => break Ok(response),
                Ok(response) if busy(response.op, response.reason) => {
                    debug!("{}: device busy, waiting", options.label);
                    report.busy += 1;
                    self.clear()?;
                    thread::sleep(options.busy_delay);
                    continue;
                },
                Ok(response) => {
                    let detail = format!(
                        "{}: unexpected {} response {:?}/{} ({})",
                        options.label,
                        D::NAME,
                        response.op,
                        response.reason,
                        response.message()
                    );
                    if response.reason == ErrorCode::BadDataChecksum {
                        warn!("{}: device reported a checksum error, retrying", options.label);
                    } else {
                        warn!("{detail}");
                    }
                    Failure::Unexpected(detail)
                },
                Err(e) if e.is_transport() => {
                    warn!("{}: {e}", options.label);
                    if options.reopen_on_io_error && matches!(e, Error::Io(_)) {
                        if let Err(reopen) = self.port.reopen() {
                            warn!(
                                "{}: reopening {} failed: {reopen}",
                                options.label,
                                self.port.name()
                            );
                        }
                    }
                    Failure::Transport(e)
                },
                Err(e) => break Err(e),
            };

            report.failures += 1;
            if report.failures > self.retry.max_retries {
                break Err(match failure {
                    Failure::Transport(_) => Error::DeviceUnresponsive {
                        operation: options.label,
                        attempts: report.failures,
                    },
                    Failure::Unexpected(detail) => Error::Protocol(detail),
                });
            }

            thread::sleep(self.retry.backoff);
            // A stale half frame would poison the next reply
            if let Err(e) = self.clear() {
                debug!("{}: clearing buffers failed: {e}", options.label);
            }
        };

        self.last_report = report;
        result
    }

    fn exchange<D: Dialect>(
        &mut self,
        request: &Request,
        timeout: Duration,
        resend: bool,
        report: &mut CallReport,
    ) -> Result<Response<D>> {
        if resend {
            self.send(request)?;
            report.sends += 1;
        }
        let frame = self.receive(timeout)?;
        Response::parse(&frame)
    }

    /// Write `chunks` with one request each, in order.
    ///
    /// A chunk is only skipped past once the device accepted it. On failure
    /// the error carries the address of the chunk that did not complete.
    pub fn write_frames<'a, D, I, A, B>(
        &mut self,
        op: D,
        chunks: I,
        options: &CallOptions,
        accept: A,
        busy: B,
        progress: &mut dyn FnMut(usize),
    ) -> Result<()>
    where
        D: Dialect,
        I: IntoIterator<Item = (u32, &'a [u8])>,
        A: Fn(D, ErrorCode) -> bool,
        B: Fn(D, ErrorCode) -> bool,
    {
        let mut written = 0;
        for (address, chunk) in chunks {
            let request = Request::new(op, address, chunk);
            self.call(&request, options, &accept, &busy)
                .map_err(|e| match e {
                    Error::Cancelled => Error::Cancelled,
                    other => Error::WriteAborted {
                        address,
                        source: Box::new(other),
                    },
                })?;
            // Device may still be emitting trailing bytes
            self.clear()?;
            written += chunk.len();
            progress(written);
        }
        Ok(())
    }

    /// Close the port.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }
}
