//! Pty master read/write loops: a reader thread that turns raw bytes into text
//! chunks, and a write path that keeps pushing until the whole buffer is accepted.

use crossbeam_channel::Sender;
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const READ_BUFFER_BYTES: usize = 4096;
const READER_POLL_MS: i32 = 20;
const WRITE_POLL_MS: i32 = 10;
/// Reads allowed after a stop request before the reader gives up on a chatty child.
const STOP_DRAIN_LIMIT: usize = 256;

pub(super) fn should_retry_read_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::Interrupted || err.kind() == ErrorKind::WouldBlock
}

/// Incremental UTF-8 decoder that carries split code points across reads and
/// drops carriage returns.
#[derive(Debug, Default)]
pub(super) struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub(super) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::with_capacity(self.pending.len());
        let mut offset = 0;
        loop {
            match std::str::from_utf8(&self.pending[offset..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    offset = self.pending.len();
                    break;
                }
                Err(err) => {
                    let good = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(
                        &self.pending[offset..offset + good],
                    ));
                    offset += good;
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            offset += len;
                        }
                        // incomplete sequence at the end; keep for the next read
                        None => break,
                    }
                }
            }
        }
        self.pending.drain(..offset);
        text.retain(|c| c != '\r');
        text
    }

    /// Flush whatever partial sequence is left once the stream ends.
    pub(super) fn finish(&mut self) -> String {
        let mut text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text.retain(|c| c != '\r');
        text
    }
}

fn poll_fd(fd: RawFd, events: libc::c_short, timeout_ms: i32) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: pollfd is a valid single-element array living on this stack frame.
    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret > 0 && pollfd.revents != 0)
}

fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    poll_fd(fd, libc::POLLIN, timeout_ms)
}

fn wait_writable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    poll_fd(fd, libc::POLLOUT, timeout_ms)
}

/// Continuously read from the pty master and forward decoded chunks.
///
/// The thread ends on end-of-stream (`EIO` once every slave descriptor is
/// closed), when the receiver goes away, or after `stop` is raised and the
/// already-buffered output has been drained.
pub(super) fn spawn_reader_thread(
    master_fd: RawFd,
    tx: Sender<String>,
    stop: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("shellpool-pty-{master_fd}"))
        .spawn(move || reader_loop(master_fd, &tx, &stop))
}

fn reader_loop(master_fd: RawFd, tx: &Sender<String>, stop: &AtomicBool) {
    let mut buffer = [0u8; READ_BUFFER_BYTES];
    let mut decoder = OutputDecoder::default();
    let mut reads_after_stop = 0usize;
    loop {
        let stopping = stop.load(Ordering::Acquire);
        if stopping {
            reads_after_stop += 1;
            if reads_after_stop > STOP_DRAIN_LIMIT {
                break;
            }
        }
        let wait_ms = if stopping { 0 } else { READER_POLL_MS };
        match wait_readable(master_fd, wait_ms) {
            Ok(true) => {}
            Ok(false) => {
                if stopping {
                    break;
                }
                continue;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(master_fd, error = %err, "pty poll failed");
                break;
            }
        }

        // SAFETY: master_fd stays open until this thread is joined, and buffer is writable.
        let n = unsafe {
            libc::read(
                master_fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };
        if n > 0 {
            let text = decoder.decode(&buffer[..n as usize]);
            if !text.is_empty() && tx.send(text).is_err() {
                return;
            }
            continue;
        }
        if n == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if should_retry_read_error(&err) {
            continue;
        }
        if err.raw_os_error() != Some(libc::EIO) {
            tracing::debug!(master_fd, error = %err, "pty read failed");
        }
        break;
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = tx.send(tail);
    }
}

/// Attempt a single write to the pty master.
pub(super) fn try_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    // SAFETY: fd is the pty master and data is a live slice.
    let written = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    if written == 0 {
        return Err(io::Error::new(ErrorKind::WriteZero, "pty write returned 0"));
    }
    Ok(written as usize)
}

/// Write the entire buffer, waiting for writability whenever the pty is full.
pub(super) fn write_all(fd: RawFd, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match try_write(fd, data) {
            Ok(written) => {
                data = data.get(written..).unwrap_or(&[]);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                wait_writable(fd, WRITE_POLL_MS)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_strips_carriage_returns() {
        let mut decoder = OutputDecoder::default();
        assert_eq!(decoder.decode(b"one\r\ntwo\r\n"), "one\ntwo\n");
    }

    #[test]
    fn decoder_carries_split_code_points() {
        let bytes = "héllo".as_bytes();
        let mut decoder = OutputDecoder::default();
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(second, "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes_and_keeps_going() {
        let mut decoder = OutputDecoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn decoder_flushes_dangling_prefix_on_finish() {
        let mut decoder = OutputDecoder::default();
        assert_eq!(decoder.decode(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn retryable_errors_are_recognized() {
        assert!(should_retry_read_error(&io::Error::from(ErrorKind::WouldBlock)));
        assert!(should_retry_read_error(&io::Error::from(ErrorKind::Interrupted)));
        assert!(!should_retry_read_error(&io::Error::from_raw_os_error(libc::EIO)));
    }

    #[test]
    fn write_all_and_reader_thread_round_trip_over_a_pipe() {
        let mut fds = [-1; 2];
        // SAFETY: fds is a two-element array as pipe requires.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_reader_thread(read_fd, tx, Arc::clone(&stop)).expect("reader");

        write_all(write_fd, b"alpha\r\nbeta").expect("write");
        // SAFETY: closing our write end signals end-of-stream to the reader.
        unsafe { libc::close(write_fd) };
        handle.join().expect("reader join");
        let text: String = rx.try_iter().collect();
        assert_eq!(text, "alpha\nbeta");
        // SAFETY: read_fd is still open and owned by the test.
        unsafe { libc::close(read_fd) };
    }
}
