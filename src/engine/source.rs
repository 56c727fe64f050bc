//! Frame sources: random-access raw files and a remote frame channel.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use super::core::{OmxError, OmxResult};

/// Input file name prefix selecting the remote frame source.
pub const REMOTE_PREFIX: &str = "plink:";

pub fn is_remote(input: &Path) -> bool {
    input.to_string_lossy().starts_with(REMOTE_PREFIX)
}

/// Raw frame file addressed by absolute byte position.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> OmxResult<Self> {
        let file = File::open(path).map_err(|e| {
            OmxError::StreamCorrupt(format!("cannot open {}: {}", path.display(), e))
        })?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read up to `buf.len()` bytes at `pos`. Returns fewer bytes only at end of file.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> OmxResult<usize> {
        self.file.seek(SeekFrom::Start(pos)).map_err(|e| {
            OmxError::StreamCorrupt(format!("seek to {} in {}: {}", pos, self.path.display(), e))
        })?;
        read_full(&mut self.file, buf)
    }

    pub fn rewind(&mut self) -> OmxResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> OmxResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Sequential overlay frames, restarting from the top at end of file.
#[derive(Debug)]
pub struct LoopingSource {
    inner: FileSource,
    frame_size: usize,
}

impl LoopingSource {
    pub fn open(path: &Path, frame_size: usize) -> OmxResult<Self> {
        let inner = FileSource::open(path)?;
        if frame_size == 0 || inner.len() < frame_size as u64 {
            return Err(OmxError::StreamCorrupt(format!(
                "{} holds no complete {}-byte frame",
                path.display(),
                frame_size
            )));
        }
        Ok(Self { inner, frame_size })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Fill `buf[..frame_size]` with the next frame.
    pub fn next_frame(&mut self, buf: &mut [u8]) -> OmxResult<usize> {
        let want = self.frame_size.min(buf.len());
        let mut n = read_full(&mut self.inner.file, &mut buf[..want])?;
        if n < want {
            self.inner.rewind()?;
            n = read_full(&mut self.inner.file, &mut buf[..want])?;
        }
        Ok(n)
    }
}

// ============================================================================
// Remote frame channel
// ============================================================================

/// Frame descriptor delivered by a remote producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFrame {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Frame(RemoteFrame),
    /// No more frames.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    /// The component is done with this frame.
    Ack { frame_id: u64 },
    Exit,
}

/// Opaque send/receive link to a remote frame producer.
///
/// Methods take `&self`: the feed loop receives while completion callbacks
/// send acknowledgements concurrently.
pub trait FrameChannel: Send + Sync {
    fn connect(&self) -> OmxResult<()>;
    fn send(&self, message: ClientMessage) -> OmxResult<()>;
    fn receive(&self) -> OmxResult<ServerMessage>;
}

/// Client end of an in-process channel pair.
pub struct LoopbackChannel {
    to_server: Sender<ClientMessage>,
    from_server: Mutex<Receiver<ServerMessage>>,
    connected: AtomicBool,
}

/// Producer end of an in-process channel pair.
pub struct LoopbackServer {
    from_client: Receiver<ClientMessage>,
    to_client: Sender<ServerMessage>,
}

pub fn loopback_pair() -> (LoopbackChannel, LoopbackServer) {
    let (to_server, from_client) = mpsc::channel();
    let (to_client, from_server) = mpsc::channel();
    (
        LoopbackChannel {
            to_server,
            from_server: Mutex::new(from_server),
            connected: AtomicBool::new(false),
        },
        LoopbackServer {
            from_client,
            to_client,
        },
    )
}

fn disconnected() -> OmxError {
    OmxError::StreamCorrupt("remote frame source disconnected".to_string())
}

impl FrameChannel for LoopbackChannel {
    fn connect(&self) -> OmxResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, message: ClientMessage) -> OmxResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(OmxError::NotReady("remote frame source not connected".to_string()));
        }
        self.to_server.send(message).map_err(|_| disconnected())
    }

    fn receive(&self) -> OmxResult<ServerMessage> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(OmxError::NotReady("remote frame source not connected".to_string()));
        }
        let rx = self
            .from_server
            .lock()
            .map_err(|_| OmxError::Undefined("frame channel lock poisoned".to_string()))?;
        rx.recv().map_err(|_| disconnected())
    }
}

/// Geometry of frames produced by [`LoopbackServer::serve_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl ProducerGeometry {
    pub fn frame_size(&self) -> usize {
        let plane = self.stride as usize * self.height as usize;
        plane + plane / 2
    }
}

impl LoopbackServer {
    /// Stream up to `max_frames` frames from a raw 4:2:0 file, keeping at most
    /// `in_flight` unacknowledged. Sends `Exit` at end of input and returns the
    /// number of frames sent once the client has said `Exit` or hung up.
    pub fn serve_file(
        self,
        path: &Path,
        geometry: ProducerGeometry,
        max_frames: Option<u64>,
        in_flight: usize,
    ) -> OmxResult<u64> {
        let mut source = FileSource::open(path)?;
        let frame_size = geometry.frame_size();
        let in_flight = in_flight.max(1);
        let mut outstanding = 0usize;
        let mut sent = 0u64;

        loop {
            if max_frames.is_some_and(|max| sent >= max) {
                break;
            }
            while outstanding >= in_flight {
                match self.from_client.recv() {
                    Ok(ClientMessage::Ack { .. }) => outstanding -= 1,
                    Ok(ClientMessage::Exit) | Err(_) => return Ok(sent),
                }
            }
            let mut data = vec![0u8; frame_size];
            let n = source.read_at(sent * frame_size as u64, &mut data)?;
            if n < frame_size {
                break;
            }
            let frame = RemoteFrame {
                id: sent,
                width: geometry.width,
                height: geometry.height,
                stride: geometry.stride,
                data,
            };
            if self.to_client.send(ServerMessage::Frame(frame)).is_err() {
                return Ok(sent);
            }
            outstanding += 1;
            sent += 1;
        }

        if self.to_client.send(ServerMessage::Exit).is_ok() {
            while let Ok(message) = self.from_client.recv() {
                if message == ClientMessage::Exit {
                    break;
                }
            }
        }
        tracing::debug!(frames = sent, "loopback producer finished");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;

    fn fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn read_at_is_absolute_and_short_at_eof() {
        let file = fixture(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let mut source = FileSource::open(file.path()).unwrap();
        let mut buf = [0u8; 4];

        assert_eq!(source.read_at(4, &mut buf).unwrap(), 4);
        assert_eq!(buf, [4, 5, 6, 7]);
        assert_eq!(source.read_at(8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[8, 9]);
        assert_eq!(source.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_file_is_stream_corrupt() {
        let err = FileSource::open(Path::new("/nonexistent/frames.yuv")).unwrap_err();
        assert_eq!(err.code(), "StreamCorrupt");
    }

    #[test]
    fn looping_source_wraps_around() {
        let file = fixture(&[1, 1, 2, 2, 3]);
        let mut overlay = LoopingSource::open(file.path(), 2).unwrap();
        let mut buf = [0u8; 2];
        let mut seen = Vec::new();
        for _ in 0..4 {
            assert_eq!(overlay.next_frame(&mut buf).unwrap(), 2);
            seen.push(buf);
        }
        assert_eq!(seen, vec![[1, 1], [2, 2], [1, 1], [2, 2]]);
    }

    #[test]
    fn remote_prefix_detection() {
        assert!(is_remote(Path::new("plink:/tmp/socket")));
        assert!(!is_remote(Path::new("/tmp/input.yuv")));
    }

    #[test]
    fn channel_requires_connect() {
        let (client, _server) = loopback_pair();
        assert_eq!(
            client.send(ClientMessage::Exit).unwrap_err().code(),
            "NotReady"
        );
    }

    #[test]
    fn loopback_streams_frames_then_exit() {
        let geometry = ProducerGeometry {
            width: 4,
            height: 2,
            stride: 4,
        };
        let frame_size = geometry.frame_size();
        let bytes: Vec<u8> = (0..3 * frame_size).map(|i| (i / frame_size) as u8).collect();
        let file = fixture(&bytes);
        let path = file.path().to_path_buf();

        let (client, server) = loopback_pair();
        let producer = thread::spawn(move || server.serve_file(&path, geometry, None, 1));

        client.connect().unwrap();
        let mut ids = Vec::new();
        loop {
            match client.receive().unwrap() {
                ServerMessage::Frame(frame) => {
                    assert_eq!(frame.data[0], frame.id as u8);
                    ids.push(frame.id);
                    client.send(ClientMessage::Ack { frame_id: frame.id }).unwrap();
                }
                ServerMessage::Exit => break,
            }
        }
        client.send(ClientMessage::Exit).unwrap();

        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(producer.join().unwrap().unwrap(), 3);
    }
}
