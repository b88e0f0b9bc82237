//! SLIP framing.
//!
//! Every request and response is wrapped in `0xC0 ... 0xC0`. Inside a frame
//! `0xDB` becomes `DB DD` and `0xC0` becomes `DB DC`.

use crate::error::{Error, Result};

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape byte.
pub const ESC: u8 = 0xDB;
/// Escaped form of [`END`].
pub const ESC_END: u8 = 0xDC;
/// Escaped form of [`ESC`].
pub const ESC_ESC: u8 = 0xDD;

/// Wrap a payload in a SLIP frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + payload.len() / 8 + 2);
    frame.push(END);
    for &byte in payload {
        match byte {
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            _ => frame.push(byte),
        }
    }
    frame.push(END);
    frame
}

/// Decode a single complete frame, delimiters included.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = Decoder::new();
    for &byte in frame {
        if let Some(packet) = decoder.push(byte)? {
            return Ok(packet);
        }
    }
    Err(Error::Framing("incomplete frame".into()))
}

/// Incremental SLIP decoder.
///
/// Bytes before the first delimiter are discarded, so a reader that starts
/// in the middle of a stream resynchronises on the next frame.
#[derive(Debug, Default)]
pub struct Decoder {
    packet: Option<Vec<u8>>,
    in_escape: bool,
}

impl Decoder {
    /// Create an idle decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.packet = None;
        self.in_escape = false;
    }

    /// Feed one byte. Returns the payload once a closing delimiter arrives.
    pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>> {
        let Some(packet) = self.packet.as_mut() else {
            if byte == END {
                self.packet = Some(Vec::new());
            }
            return Ok(None);
        };

        if self.in_escape {
            self.in_escape = false;
            match byte {
                ESC_END => packet.push(END),
                ESC_ESC => packet.push(ESC),
                other => {
                    self.reset();
                    return Err(Error::Framing(format!(
                        "invalid escape sequence {ESC:#04x} {other:#04x}"
                    )));
                },
            }
            return Ok(None);
        }

        match byte {
            ESC => self.in_escape = true,
            END => return Ok(self.packet.take()),
            _ => packet.push(byte),
        }
        Ok(None)
    }
}

/// Lazy sequence of payloads read from a byte source.
///
/// Yields `Error::Timeout` when the source stops producing bytes before a
/// frame completes, and `Error::Framing` on a bad escape.
pub struct FrameReader<R> {
    source: R,
    decoder: Decoder,
}

impl<R: std::io::Read> FrameReader<R> {
    /// Wrap a byte source.
    pub fn new(source: R) -> Self {
        Self {
            source,
            decoder: Decoder::new(),
        }
    }
}

impl<R: std::io::Read> Iterator for FrameReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut byte = [0u8; 1];
        loop {
            match self.source.read(&mut byte) {
                Ok(0) => return Some(Err(Error::Timeout("no data before frame end".into()))),
                Ok(_) => match self.decoder.push(byte[0]) {
                    Ok(Some(packet)) => return Some(Ok(packet)),
                    Ok(None) => {},
                    Err(e) => return Some(Err(e)),
                },
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Some(Err(Error::Timeout("no data before frame end".into())));
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_escapes_in_order() {
        assert_eq!(encode(&[0x01, END, 0x02]), vec![END, 0x01, ESC, ESC_END, 0x02, END]);
        assert_eq!(encode(&[ESC]), vec![END, ESC, ESC_ESC, END]);
        // An escaped ESC must not be re-read as an escaped END.
        assert_eq!(encode(&[ESC, ESC_END]), vec![END, ESC, ESC_ESC, ESC_END, END]);
    }

    #[test]
    fn test_greeting_frame_bytes() {
        let mut body = vec![0xC2];
        body.extend_from_slice(&[0u8; 12]);
        let frame = encode(&body);
        assert_eq!(frame.len(), 15);
        assert_eq!(frame[0], END);
        assert_eq!(frame[1], 0xC2);
        assert_eq!(frame[14], END);
    }

    #[test]
    fn test_round_trip_special_bytes_everywhere() {
        let specials = [END, ESC, ESC_END, ESC_ESC, 0x00, 0xFF];
        for len in 0..4 {
            let mut indices = vec![0usize; len];
            loop {
                let payload: Vec<u8> = indices.iter().map(|&i| specials[i]).collect();
                assert_eq!(decode(&encode(&payload)).unwrap(), payload);

                // odometer over all combinations
                let mut pos = 0;
                while pos < len {
                    indices[pos] += 1;
                    if indices[pos] < specials.len() {
                        break;
                    }
                    indices[pos] = 0;
                    pos += 1;
                }
                if pos == len {
                    break;
                }
            }
        }
    }

    #[test]
    fn test_round_trip_all_byte_values() {
        let payload: Vec<u8> = (0..=255u8).rev().chain(0..=255u8).collect();
        assert_eq!(decode(&encode(&payload)).unwrap(), payload);
    }

    #[test]
    fn test_invalid_escape_is_framing_error() {
        let err = decode(&[END, 0x01, ESC, 0x42, END]).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn test_garbage_before_frame_is_skipped() {
        let mut stream = vec![0x11, 0x22];
        stream.extend(encode(&[0xE0, 0x01]));
        assert_eq!(decode(&stream).unwrap(), vec![0xE0, 0x01]);
    }

    #[test]
    fn test_incomplete_frame() {
        assert!(matches!(decode(&[END, 0x01]), Err(Error::Framing(_))));
    }

    #[test]
    fn test_frame_reader_yields_each_packet_then_times_out() {
        let mut stream = encode(b"one");
        stream.extend(encode(&[END, ESC]));
        let mut reader = FrameReader::new(std::io::Cursor::new(stream));

        assert_eq!(reader.next().unwrap().unwrap(), b"one");
        assert_eq!(reader.next().unwrap().unwrap(), vec![END, ESC]);
        assert!(matches!(reader.next(), Some(Err(Error::Timeout(_)))));
    }

    #[test]
    fn test_frame_reader_reports_bad_escape() {
        let reader = FrameReader::new(std::io::Cursor::new(vec![END, ESC, 0x00, END]));
        let results: Vec<_> = reader.take(1).collect();
        assert!(matches!(results[0], Err(Error::Framing(_))));
    }
}
