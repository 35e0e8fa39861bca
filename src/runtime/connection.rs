//! Connection state machine and registry.
//!
//! A connection alternates between two working states:
//!
//! ```text
//!            frame buffered                 response fully sent
//! AwaitingRequest ───────────▶ SendingResponse ───────────▶ AwaitingRequest
//!        │                            │
//!        └──── EOF / error / bad frame ┴──── write error ──▶ Terminal
//! ```
//!
//! [`Connection::drive`] runs the machine until the socket would block, then
//! tells the reactor what readiness to wait for next. Each step returns an
//! explicit [`Step`] instead of calling into the other state, so the whole
//! hand-off lives in one loop.
//!
//! At most one response is queued at a time. Pipelined requests stay in the
//! read buffer until the current response has drained.

use crate::command::dispatch;
use crate::protocol::{self, FrameError, LEN_PREFIX};
use crate::runtime::buffer::{ReadBuffer, WriteBuffer};
use crate::storage::Store;
use slab::Slab;
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::trace;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading and parsing requests.
    AwaitingRequest,
    /// Flushing the single queued response.
    SendingResponse,
    /// Done. The reactor releases the socket.
    Terminal,
}

/// What the reactor should do with a connection after driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    WaitReadable,
    WaitWritable,
    Close,
}

/// Why a connection reached [`ConnState::Terminal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("EOF")]
    Eof,

    #[error("unexpected EOF with {buffered} bytes buffered")]
    UnexpectedEof { buffered: usize },

    #[error("I/O error: {0}")]
    Io(io::ErrorKind),

    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),
}

/// Outcome of a single state step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// State may have changed; run the next step now.
    Continue,
    /// The socket would block; hand control back to the reactor.
    Yield,
}

/// A single client connection over any non-blocking byte stream.
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    close_reason: Option<CloseReason>,
    requests: u64,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap a freshly accepted stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnState::AwaitingRequest,
            read_buf: ReadBuffer::new(),
            write_buf: WriteBuffer::new(),
            close_reason: None,
            requests: 0,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Requests served so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Readiness the current state waits for.
    pub fn directive(&self) -> Directive {
        match self.state {
            ConnState::AwaitingRequest => Directive::WaitReadable,
            ConnState::SendingResponse => Directive::WaitWritable,
            ConnState::Terminal => Directive::Close,
        }
    }

    /// Run the state machine until the stream would block or the connection
    /// terminates.
    pub fn drive(&mut self, store: &mut Store) -> Directive {
        loop {
            let step = match self.state {
                ConnState::AwaitingRequest => self.await_request(store),
                ConnState::SendingResponse => self.send_response(),
                ConnState::Terminal => break,
            };
            if step == Step::Yield {
                break;
            }
        }
        self.directive()
    }

    fn terminate(&mut self, reason: CloseReason) -> Step {
        trace!(%reason, "connection terminating");
        self.state = ConnState::Terminal;
        self.close_reason = Some(reason);
        Step::Continue
    }

    /// Serve a buffered frame if there is one, otherwise read more.
    fn await_request(&mut self, store: &mut Store) -> Step {
        match protocol::frame_len(self.read_buf.data()) {
            Ok(Some(len)) => self.process_frame(len, store),
            Ok(None) => self.fill(),
            Err(e) => self.terminate(e.into()),
        }
    }

    fn fill(&mut self) -> Step {
        // Any frame within the length bound fits the buffer, so a full buffer
        // always contains a complete frame.
        assert!(
            !self.read_buf.is_full(),
            "read buffer full without a complete frame"
        );

        match self.stream.read(self.read_buf.spare_mut()) {
            Ok(0) => {
                let reason = if self.read_buf.is_empty() {
                    CloseReason::Eof
                } else {
                    CloseReason::UnexpectedEof {
                        buffered: self.read_buf.len(),
                    }
                };
                self.terminate(reason)
            }
            Ok(n) => {
                self.read_buf.advance(n);
                trace!(n, buffered = self.read_buf.len(), "read");
                Step::Continue
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Step::Yield,
            Err(e) => self.terminate(CloseReason::Io(e.kind())),
        }
    }

    /// Decode and execute the frame occupying `read_buf[..len]`, queue its
    /// response and switch to sending.
    fn process_frame(&mut self, len: usize, store: &mut Store) -> Step {
        let encoded = {
            let body = &self.read_buf.data()[LEN_PREFIX..len];
            match protocol::decode_request(body) {
                Ok(args) => {
                    let response = dispatch(&args, store);
                    protocol::encode_response(
                        response.status,
                        &response.payload,
                        self.write_buf.space_mut(),
                    )
                }
                Err(e) => Err(e),
            }
        };

        match encoded {
            Ok(n) => {
                self.write_buf.queue(n);
                self.read_buf.consume(len);
                self.requests += 1;
                self.state = ConnState::SendingResponse;
                Step::Continue
            }
            Err(e) => self.terminate(e.into()),
        }
    }

    fn send_response(&mut self) -> Step {
        match self.stream.write(self.write_buf.pending()) {
            Ok(0) => self.terminate(CloseReason::Io(io::ErrorKind::WriteZero)),
            Ok(n) => {
                if self.write_buf.advance(n) {
                    trace!(n, "response sent");
                    self.state = ConnState::AwaitingRequest;
                }
                Step::Continue
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Step::Yield,
            Err(e) => self.terminate(CloseReason::Io(e.kind())),
        }
    }
}

/// Registry of live connections using slab allocation.
///
/// Ids are slab keys, independent of descriptor numbers, and freed slots are
/// reused. A removed connection is dropped by the caller, which closes its
/// socket.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            // Grows on demand; large limits should not preallocate.
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.is_full() {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_response, encode_request, frame_len, Status, MAX_MESSAGE_BYTES};
    use bytes::BufMut;
    use std::collections::VecDeque;

    #[derive(Debug)]
    enum ReadStep {
        Data(Vec<u8>),
        WouldBlock,
        Interrupted,
        Eof,
        Fail,
    }

    #[derive(Debug)]
    enum WriteStep {
        Accept(usize),
        WouldBlock,
        Interrupted,
        Fail,
    }

    /// Scripted non-blocking stream. An exhausted read script reports
    /// would-block; an exhausted write script accepts everything.
    #[derive(Debug, Default)]
    struct MockStream {
        reads: VecDeque<ReadStep>,
        writes: VecDeque<WriteStep>,
        written: Vec<u8>,
    }

    impl MockStream {
        fn with_reads(reads: impl IntoIterator<Item = ReadStep>) -> Self {
            Self {
                reads: reads.into_iter().collect(),
                ..Default::default()
            }
        }

        fn reads_exhausted(&self) -> bool {
            self.reads.is_empty()
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None | Some(ReadStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
                Some(ReadStep::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
                Some(ReadStep::Eof) => Ok(0),
                Some(ReadStep::Fail) => Err(io::ErrorKind::ConnectionReset.into()),
                Some(ReadStep::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(ReadStep::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.writes.pop_front() {
                None => {
                    self.written.extend_from_slice(buf);
                    Ok(buf.len())
                }
                Some(WriteStep::Accept(n)) => {
                    let n = n.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(WriteStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
                Some(WriteStep::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
                Some(WriteStep::Fail) => Err(io::ErrorKind::BrokenPipe.into()),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request(args: &[&str]) -> Vec<u8> {
        encode_request(args).unwrap()
    }

    fn requests(reqs: &[&[&str]]) -> Vec<u8> {
        reqs.iter().flat_map(|args| request(args)).collect()
    }

    /// Split a byte stream into decoded response frames.
    fn responses(mut bytes: &[u8]) -> Vec<(Status, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(len) = frame_len(bytes).unwrap() {
            let (status, payload) = decode_response(&bytes[..len]).unwrap();
            out.push((status, payload.to_vec()));
            bytes = &bytes[len..];
        }
        assert!(bytes.is_empty(), "trailing partial frame: {bytes:?}");
        out
    }

    /// Keep driving, as repeated readiness events would, until the read script
    /// is exhausted and the connection waits for input, or it closes.
    fn pump(conn: &mut Connection<MockStream>, store: &mut Store) -> Directive {
        for _ in 0..100_000 {
            let directive = conn.drive(store);
            if directive == Directive::Close
                || (directive == Directive::WaitReadable && conn.stream().reads_exhausted())
            {
                return directive;
            }
        }
        panic!("connection never settled");
    }

    fn scenario() -> Vec<u8> {
        requests(&[&["set", "a", "1"], &["get", "a"], &["del", "a"], &["get", "a"]])
    }

    fn scenario_responses() -> Vec<(Status, Vec<u8>)> {
        vec![
            (Status::Ok, vec![]),
            (Status::Ok, b"1".to_vec()),
            (Status::Ok, vec![]),
            (Status::NotFound, vec![]),
        ]
    }

    #[test]
    fn test_new_connection_awaits_request() {
        let conn = Connection::new(MockStream::default());
        assert_eq!(conn.state, ConnState::AwaitingRequest);
        assert_eq!(conn.directive(), Directive::WaitReadable);
    }

    #[test]
    fn test_pipelined_requests_in_one_read() {
        let mut store = Store::new();
        let mut conn = Connection::new(MockStream::with_reads([ReadStep::Data(scenario())]));

        // Writes never block, so a single wake-up serves all four.
        assert_eq!(conn.drive(&mut store), Directive::WaitReadable);
        assert_eq!(responses(&conn.stream().written), scenario_responses());
        assert_eq!(conn.requests(), 4);
        assert!(conn.read_buf.is_empty());
    }

    #[test]
    fn test_pipelining_with_backpressure() {
        let mut store = Store::new();
        let mut stream = MockStream::with_reads([ReadStep::Data(scenario())]);
        for _ in 0..40 {
            stream.writes.push_back(WriteStep::Accept(3));
            stream.writes.push_back(WriteStep::WouldBlock);
        }
        let mut conn = Connection::new(stream);

        assert_eq!(conn.drive(&mut store), Directive::WaitWritable);
        // Only the first response is in flight; the rest wait in the read buffer.
        assert_eq!(conn.stream().written.len(), 3);
        assert_eq!(conn.write_buf.len(), 8);
        assert_eq!(conn.requests(), 1);
        assert_eq!(conn.read_buf.len(), scenario().len() - request(&["set", "a", "1"]).len());

        assert_eq!(pump(&mut conn, &mut store), Directive::WaitReadable);
        assert_eq!(responses(&conn.stream().written), scenario_responses());
    }

    #[test]
    fn test_buffered_requests_resume_after_flush() {
        let mut store = Store::new();
        let mut stream = MockStream::with_reads([ReadStep::Data(requests(&[
            &["set", "k", "v"],
            &["get", "k"],
        ]))]);
        stream.writes.push_back(WriteStep::WouldBlock);
        let mut conn = Connection::new(stream);

        assert_eq!(conn.drive(&mut store), Directive::WaitWritable);
        assert!(conn.stream().written.is_empty());

        // A writable event alone must also serve the second buffered request.
        assert_eq!(conn.drive(&mut store), Directive::WaitReadable);
        assert_eq!(
            responses(&conn.stream().written),
            vec![(Status::Ok, vec![]), (Status::Ok, b"v".to_vec())]
        );
    }

    #[test]
    fn test_fragmented_input_matches_single_read() {
        let input = scenario();

        for split in 0..=input.len() {
            let (head, tail) = input.split_at(split);
            let mut reads = Vec::new();
            for part in [head, tail] {
                if !part.is_empty() {
                    reads.push(ReadStep::Data(part.to_vec()));
                    reads.push(ReadStep::WouldBlock);
                }
            }

            let mut store = Store::new();
            let mut conn = Connection::new(MockStream::with_reads(reads));
            assert_eq!(pump(&mut conn, &mut store), Directive::WaitReadable);
            assert_eq!(
                responses(&conn.stream().written),
                scenario_responses(),
                "split at {split}"
            );
        }

        for chunk in 1..=9 {
            let reads = input
                .chunks(chunk)
                .flat_map(|c| [ReadStep::Data(c.to_vec()), ReadStep::WouldBlock]);

            let mut store = Store::new();
            let mut conn = Connection::new(MockStream::with_reads(reads));
            assert_eq!(pump(&mut conn, &mut store), Directive::WaitReadable);
            assert_eq!(
                responses(&conn.stream().written),
                scenario_responses(),
                "chunks of {chunk}"
            );
        }
    }

    #[test]
    fn test_oversized_frame_closes_without_response() {
        let mut data = Vec::new();
        data.put_u32_le(MAX_MESSAGE_BYTES as u32 + 1);
        data.put_slice(&[0u8; 16]);

        let mut store = Store::new();
        let mut conn = Connection::new(MockStream::with_reads([ReadStep::Data(data)]));

        assert_eq!(conn.drive(&mut store), Directive::Close);
        assert_eq!(conn.state, ConnState::Terminal);
        assert!(conn.stream().written.is_empty());
        assert_eq!(
            conn.close_reason(),
            Some(&CloseReason::Protocol(FrameError::Oversized {
                len: 4097,
                max: 4096
            }))
        );
    }

    #[test]
    fn test_oversized_frame_after_valid_one() {
        let mut data = request(&["set", "k", "v"]);
        data.put_u32_le(u32::MAX);

        let mut store = Store::new();
        let mut conn = Connection::new(MockStream::with_reads([ReadStep::Data(data)]));

        assert_eq!(conn.drive(&mut store), Directive::Close);
        assert_eq!(responses(&conn.stream().written), vec![(Status::Ok, vec![])]);
        assert_eq!(store.get(b"k"), Some(b"v".as_slice()));
    }

    #[test]
    fn test_malformed_frame_closes() {
        // total_len = 12, argc = 1, arg_len = 100: runs past the frame.
        let mut data = Vec::new();
        data.put_u32_le(12);
        data.put_u32_le(1);
        data.put_u32_le(100);
        data.put_slice(b"abcd");

        let mut store = Store::new();
        let mut conn = Connection::new(MockStream::with_reads([ReadStep::Data(data)]));

        assert_eq!(conn.drive(&mut store), Directive::Close);
        assert!(conn.stream().written.is_empty());
        assert_eq!(
            conn.close_reason(),
            Some(&CloseReason::Protocol(FrameError::ArgOutOfBounds))
        );
    }

    #[test]
    fn test_command_error_keeps_connection_open() {
        let mut store = Store::new();
        let data = requests(&[&["incr", "k"], &["get"], &["get", "k"]]);
        let mut conn = Connection::new(MockStream::with_reads([ReadStep::Data(data)]));

        assert_eq!(conn.drive(&mut store), Directive::WaitReadable);
        assert_eq!(
            responses(&conn.stream().written),
            vec![
                (Status::Err, b"unknown command 'incr'".to_vec()),
                (Status::Err, b"wrong number of arguments for 'get'".to_vec()),
                (Status::NotFound, vec![]),
            ]
        );
    }

    #[test]
    fn test_clean_eof() {
        let mut store = Store::new();
        let mut conn = Connection::new(MockStream::with_reads([
            ReadStep::Data(request(&["get", "k"])),
            ReadStep::Eof,
        ]));

        assert_eq!(conn.drive(&mut store), Directive::Close);
        assert_eq!(conn.close_reason(), Some(&CloseReason::Eof));
        assert_eq!(responses(&conn.stream().written).len(), 1);
    }

    #[test]
    fn test_eof_mid_frame() {
        let frame = request(&["get", "k"]);
        let mut store = Store::new();
        let mut conn = Connection::new(MockStream::with_reads([
            ReadStep::Data(frame[..5].to_vec()),
            ReadStep::Eof,
        ]));

        assert_eq!(conn.drive(&mut store), Directive::Close);
        assert_eq!(
            conn.close_reason(),
            Some(&CloseReason::UnexpectedEof { buffered: 5 })
        );
    }

    #[test]
    fn test_interrupted_calls_are_retried() {
        let mut store = Store::new();
        let mut stream = MockStream::with_reads([
            ReadStep::Interrupted,
            ReadStep::Data(request(&["set", "k", "v"])),
        ]);
        stream.writes.push_back(WriteStep::Interrupted);
        stream.writes.push_back(WriteStep::Accept(1));
        stream.writes.push_back(WriteStep::Interrupted);
        let mut conn = Connection::new(stream);

        assert_eq!(conn.drive(&mut store), Directive::WaitReadable);
        assert_eq!(responses(&conn.stream().written), vec![(Status::Ok, vec![])]);
    }

    #[test]
    fn test_read_error_closes() {
        let mut store = Store::new();
        let mut conn = Connection::new(MockStream::with_reads([ReadStep::Fail]));

        assert_eq!(conn.drive(&mut store), Directive::Close);
        assert_eq!(
            conn.close_reason(),
            Some(&CloseReason::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_write_error_closes() {
        let mut store = Store::new();
        let mut stream = MockStream::with_reads([ReadStep::Data(request(&["get", "k"]))]);
        stream.writes.push_back(WriteStep::Accept(2));
        stream.writes.push_back(WriteStep::Fail);
        let mut conn = Connection::new(stream);

        assert_eq!(conn.drive(&mut store), Directive::Close);
        assert_eq!(
            conn.close_reason(),
            Some(&CloseReason::Io(io::ErrorKind::BrokenPipe))
        );
    }

    #[test]
    fn test_zero_length_write_closes() {
        let mut store = Store::new();
        let mut stream = MockStream::with_reads([ReadStep::Data(request(&["get", "k"]))]);
        stream.writes.push_back(WriteStep::Accept(0));
        let mut conn = Connection::new(stream);

        assert_eq!(conn.drive(&mut store), Directive::Close);
        assert_eq!(
            conn.close_reason(),
            Some(&CloseReason::Io(io::ErrorKind::WriteZero))
        );
    }

    #[test]
    fn test_max_size_frame_fills_buffer() {
        // 4 (argc) + 7 ("set") + 5 ("k") + 4 + value = 4096
        let value = "x".repeat(MAX_MESSAGE_BYTES - 20);
        let set = request(&["set", "k", value.as_str()]);
        assert_eq!(set.len(), crate::protocol::MAX_FRAME_BYTES);

        let mut data = set.clone();
        data.extend(request(&["get", "k"]));

        let mut store = Store::new();
        let mut conn = Connection::new(MockStream::with_reads([ReadStep::Data(data)]));

        assert_eq!(pump(&mut conn, &mut store), Directive::WaitReadable);
        assert_eq!(
            responses(&conn.stream().written),
            vec![(Status::Ok, vec![]), (Status::Ok, value.into_bytes())]
        );
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert(Connection::new(MockStream::default())).ok().unwrap();
        let id2 = registry.insert(Connection::new(MockStream::default())).ok().unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.insert(Connection::new(MockStream::default())).is_err());

        assert_eq!(registry.len(), 2);
        assert!(registry.get_mut(id2).is_some());

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert!(registry.get_mut(id1).is_none());
        assert_eq!(registry.len(), 1);

        // Freed slots are reused.
        let id3 = registry.insert(Connection::new(MockStream::default())).ok().unwrap();
        assert_eq!(id3, id1);
    }
}
