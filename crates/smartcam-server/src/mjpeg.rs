/// MJPEG-over-HTTP capture for ESP32 camera firmware.
///
/// Opening a session applies the frame size through the camera's
/// `/control?var=framesize&val=N` endpoint (best effort), then issues a
/// plain `GET <stream_path>` on a socket with bounded connect and read
/// timeouts. Frames are cut out of the multipart body by their JPEG SOI /
/// EOI markers, so part headers and boundaries never need parsing. Reads
/// are paced to the configured frame-rate cap.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::runtime::Handle;
use tracing::{debug, info};

use smartcam_core::capture::{CaptureBackend, CaptureSession, CaptureSettings, Frame, StreamClosed};
use smartcam_core::device::ResolvedDevice;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on buffered bytes without a complete frame.
const MAX_PENDING: usize = 4 * 1024 * 1024;
const MAX_HEADER: usize = 8 * 1024;
const READ_CHUNK: usize = 16 * 1024;

pub struct MjpegBackend {
    http: reqwest::Client,
    runtime: Handle,
    control_port: u16,
}

impl MjpegBackend {
    pub fn new(http: reqwest::Client, runtime: Handle, control_port: u16) -> Self {
        Self {
            http,
            runtime,
            control_port,
        }
    }

    /// Ask the camera to switch frame size. Failures are only logged.
    fn apply_frame_size(&self, device: &ResolvedDevice, settings: &CaptureSettings) {
        let url = format!(
            "http://{}:{}/control?var=framesize&val={}",
            device.ip,
            self.control_port,
            settings.frame_size.control_value()
        );
        let request = self.http.get(&url).timeout(settings.connect_timeout()).send();

        match self.runtime.block_on(request) {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %url, "Frame size applied");
            }
            Ok(resp) => debug!(url = %url, status = %resp.status(), "Frame size control rejected"),
            Err(e) => debug!(url = %url, error = %e, "Frame size control unreachable"),
        }
    }
}

impl CaptureBackend for MjpegBackend {
    fn open(
        &self,
        device: &ResolvedDevice,
        settings: &CaptureSettings,
    ) -> anyhow::Result<Box<dyn CaptureSession>> {
        self.apply_frame_size(device, settings);

        let mut stream = connect(device.addr(), settings)?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: multipart/x-mixed-replace\r\nConnection: keep-alive\r\n\r\n",
            device.config.stream_path,
            device.ip
        );
        stream
            .write_all(request.as_bytes())
            .with_context(|| format!("failed to request {}", device.stream_url()))?;

        let pending = read_response_head(&mut stream)
            .with_context(|| format!("bad stream response from {}", device.stream_url()))?;

        info!(url = %device.stream_url(), frame_size = ?settings.frame_size, "MJPEG stream opened");

        Ok(Box::new(MjpegSession {
            stream,
            pending,
            read_timeout: settings.read_timeout(),
            frame_interval: settings.frame_interval(),
            last_frame: None,
        }))
    }
}

/// Connect with timeouts, keepalive and no Nagle delay.
fn connect(addr: SocketAddr, settings: &CaptureSettings) -> anyhow::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket
        .connect_timeout(&addr.into(), settings.connect_timeout())
        .with_context(|| format!("connect to {} timed out or was refused", addr))?;

    socket.set_nodelay(true)?;
    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(5)))?;
    socket.set_read_timeout(Some(settings.read_timeout()))?;
    socket.set_write_timeout(Some(settings.connect_timeout()))?;

    Ok(socket.into())
}

/// Consume the HTTP status line and headers. Returns any body bytes that
/// arrived with them.
fn read_response_head(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            break end;
        }
        if buf.len() > MAX_HEADER {
            bail!("response header exceeds {} bytes", MAX_HEADER);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            bail!("connection closed before response header");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]);
    let status = parse_status(&head).context("malformed status line")?;
    if status != 200 {
        bail!("stream returned HTTP {}", status);
    }

    Ok(buf.split_off(header_end + 4))
}

fn parse_status(head: &str) -> Option<u16> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

struct MjpegSession {
    stream: TcpStream,
    pending: Vec<u8>,
    read_timeout: Duration,
    frame_interval: Option<Duration>,
    last_frame: Option<Instant>,
}

impl MjpegSession {
    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_frame) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame = Some(Instant::now());
    }
}

impl CaptureSession for MjpegSession {
    fn read_frame(&mut self) -> anyhow::Result<Frame> {
        let deadline = Instant::now() + self.read_timeout;
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            if let Some(jpeg) = extract_jpeg(&mut self.pending) {
                self.pace();
                return Ok(Frame::new(jpeg));
            }
            if Instant::now() >= deadline {
                bail!("no complete frame within {}ms", self.read_timeout.as_millis());
            }
            if self.pending.len() > MAX_PENDING {
                self.pending.clear();
                bail!("discarded {} bytes without a frame", MAX_PENDING);
            }

            let n = match self.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if is_hangup(&e) => return Err(StreamClosed.into()),
                Err(e) => return Err(anyhow::Error::new(e).context("stream read failed")),
            };
            if n == 0 {
                return Err(StreamClosed.into());
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

fn is_hangup(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof
    )
}

/// Remove and return the first complete JPEG in `buf`. Bytes ahead of the
/// SOI marker (boundaries, part headers) are discarded.
pub fn extract_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = match find(buf, &SOI) {
        Some(start) => start,
        None => {
            // Keep a trailing 0xFF that may begin a marker
            let keep = usize::from(buf.last() == Some(&0xFF));
            buf.drain(..buf.len() - keep);
            return None;
        }
    };
    buf.drain(..start);

    let end = find(&buf[SOI.len()..], &EOI)? + SOI.len() + EOI.len();
    let rest = buf.split_off(end);
    Some(std::mem::replace(buf, rest))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(body: &[u8]) -> Vec<u8> {
        let mut part = format!(
            "\r\n--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        part.extend_from_slice(body);
        part
    }

    #[test]
    fn extracts_frames_across_boundaries() {
        let first = [0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        let second = [0xFF, 0xD8, 0x03, 0xFF, 0xD9];
        let mut buf = part(&first);
        buf.extend(part(&second));

        assert_eq!(extract_jpeg(&mut buf).unwrap(), first);
        assert_eq!(extract_jpeg(&mut buf).unwrap(), second);
        assert!(extract_jpeg(&mut buf).is_none());
    }

    #[test]
    fn incomplete_frame_stays_buffered() {
        let mut buf = part(&[0xFF, 0xD8, 0x10, 0x20]);
        assert!(extract_jpeg(&mut buf).is_none());
        assert_eq!(&buf[..2], &SOI);

        buf.extend_from_slice(&[0x30, 0xFF, 0xD9]);
        assert_eq!(extract_jpeg(&mut buf).unwrap(), [0xFF, 0xD8, 0x10, 0x20, 0x30, 0xFF, 0xD9]);
    }

    #[test]
    fn split_marker_is_not_lost() {
        let mut buf = b"--frame\r\n\r\n\xFF".to_vec();
        assert!(extract_jpeg(&mut buf).is_none());
        assert_eq!(buf, [0xFF]);

        buf.extend_from_slice(&[0xD8, 0x42, 0xFF, 0xD9]);
        assert_eq!(extract_jpeg(&mut buf).unwrap(), [0xFF, 0xD8, 0x42, 0xFF, 0xD9]);
    }

    #[test]
    fn parses_status_line() {
        assert_eq!(parse_status("HTTP/1.1 200 OK\r\nContent-Type: x"), Some(200));
        assert_eq!(parse_status("HTTP/1.0 503 Busy"), Some(503));
        assert_eq!(parse_status("garbage"), None);
    }

    #[test]
    fn session_reads_from_local_stream() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 512];
            let _ = conn.read(&mut request).unwrap();
            let mut response =
                b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace;boundary=frame\r\n\r\n".to_vec();
            response.extend(part(&[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]));
            conn.write_all(&response).unwrap();
        });

        let settings = CaptureSettings { max_fps: 0, ..CaptureSettings::default() };
        let mut stream = connect(addr, &settings).unwrap();
        stream.write_all(b"GET /stream HTTP/1.1\r\n\r\n").unwrap();
        let pending = read_response_head(&mut stream).unwrap();

        let mut session = MjpegSession {
            stream,
            pending,
            read_timeout: settings.read_timeout(),
            frame_interval: None,
            last_frame: None,
        };
        let frame = session.read_frame().unwrap();
        assert_eq!(&frame.jpeg[..], &[0xFF, 0xD8, 0xAA, 0xFF, 0xD9]);

        server.join().unwrap();
        let closed = session.read_frame().unwrap_err();
        assert!(smartcam_core::capture::is_stream_closed(&closed));
    }
}
