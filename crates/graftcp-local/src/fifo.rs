//! Decoder for the "about to connect" notification pipe.
//!
//! Each line is `<dest-ip>:<dest-port>:<pid>`. IPv6 destinations carry their
//! own colons, so the pid and port are taken from the end of the record and
//! whatever precedes them is the address.

use std::io;
use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tracing::Instrument;

use crate::error::DecodeError;
use crate::registry::Registry;

/// One decoded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidAddr {
    pub pid: String,
    /// `ip:port` or `[ipv6]:port`, ready to dial.
    pub addr: String,
}

/// Decode a single record.
pub fn decode_record(line: &str) -> Result<PidAddr, DecodeError> {
    let fields: Vec<&str> = line.split(':').collect();
    match fields.len() {
        n if n < 3 => Err(DecodeError::Malformed(line.to_string())),
        3 => Ok(PidAddr {
            pid: fields[2].to_string(),
            addr: format!("{}:{}", fields[0], fields[1]),
        }),
        n => {
            let pid = fields[n - 1];
            let port = fields[n - 2];
            // Strip ":<port>:<pid>"; the cut lands on an ASCII colon.
            let ip = &line[..line.len() - 2 - pid.len() - port.len()];
            Ok(PidAddr {
                pid: pid.to_string(),
                addr: format!("[{ip}]:{port}"),
            })
        }
    }
}

/// Decode records from `reader` until end-of-stream or a read error,
/// handing each one to the registry on its own task.
///
/// Returns the number of records decoded.
pub async fn run_decoder<R>(mut reader: R, registry: Arc<dyn Registry>) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let mut decoded = 0usize;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::error!(records = decoded, "Notification pipe closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, records = decoded, "Notification pipe read failed");
                break;
            }
        }

        // A bad record costs only itself
        let line = match std::str::from_utf8(trim_line_end(&buf)) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Skipping non-UTF-8 notification record");
                continue;
            }
        };

        match decode_record(line) {
            Ok(PidAddr { pid, addr }) => {
                decoded += 1;
                let registry = registry.clone();
                tokio::spawn(async move { registry.insert(pid, addr) });
            }
            Err(e) => tracing::error!(error = %e, "Skipping notification record"),
        }
    }

    tracing::Span::current().record("records", decoded);
    decoded
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Create the pipe at `path` if needed and open it for reading.
///
/// The pipe is opened read-write so this process always holds a writer:
/// traced processes opening and closing it never end the stream, and their
/// opens never fail for lack of a reader.
pub fn open_pipe(path: &Path) -> io::Result<pipe::Receiver> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) => tracing::info!(path = %path.display(), "Created notification pipe"),
        Err(Errno::EEXIST) => {}
        Err(e) => return Err(e.into()),
    }
    pipe::OpenOptions::new().read_write(true).open_receiver(path)
}

/// Open the pipe at `path` once and decode it until it fails.
pub async fn run_from_path(path: String, registry: Arc<dyn Registry>) -> usize {
    let span = graftcp_tracing::fifo_span!(&path);

    async {
        let receiver = match open_pipe(Path::new(&path)) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::error!(error = %e, "Failed to open notification pipe");
                return 0;
            }
        };
        tracing::info!("Notification pipe opened");
        run_decoder(BufReader::new(receiver), registry).await
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegistry;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir().join(format!("graftcp-fifo-{}", uuid::Uuid::new_v4()))
    }

    async fn wait_for_len(table: &FakeRegistry, len: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while table.table.len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("inserts should land");
    }

    /// Retry until the reader side has created and opened the pipe.
    async fn open_writer(path: &Path) -> pipe::Sender {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(sender) = pipe::OpenOptions::new().open_sender(path) {
                    return sender;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipe should accept writers")
    }

    #[test]
    fn test_decode_ipv4_record() {
        let rec = decode_record("127.0.0.1:8080:4321").unwrap();
        assert_eq!(rec.pid, "4321");
        assert_eq!(rec.addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_decode_ipv6_loopback() {
        let rec = decode_record("::1:8080:4321").unwrap();
        assert_eq!(rec.pid, "4321");
        assert_eq!(rec.addr, "[::1]:8080");
    }

    #[test]
    fn test_decode_ipv6_reconstructs_exact_address() {
        let cases = [
            ("fe80::1", "22", "7"),
            ("2001:db8:85a3::8a2e:370:7334", "443", "123456"),
            ("::ffff:10.0.0.1", "65535", "1"),
            ("2001:0db8:0000:0000:0000:ff00:0042:8329", "8", "99999"),
        ];
        for (ip, port, pid) in cases {
            let rec = decode_record(&format!("{ip}:{port}:{pid}")).unwrap();
            assert_eq!(rec.addr, format!("[{ip}]:{port}"));
            assert_eq!(rec.pid, pid);
            assert!(rec.addr.parse::<SocketAddr>().is_ok(), "{} must be dialable", rec.addr);
        }
    }

    #[test]
    fn test_decode_rejects_short_records() {
        assert_eq!(
            decode_record("10.0.0.1:80"),
            Err(DecodeError::Malformed("10.0.0.1:80".to_string()))
        );
        assert!(decode_record("").is_err());
        assert!(decode_record("garbage").is_err());
    }

    #[tokio::test]
    async fn test_decoder_skips_malformed_and_stops_at_eof() {
        let input: &[u8] = b"127.0.0.1:80:100\nnot-a-record\n::1:443:200\r\n10.0.0.1:22:300\n";
        let table = Arc::new(FakeRegistry::new(None));
        let registry: Arc<dyn Registry> = table.clone();

        let decoded = run_decoder(input, registry).await;
        assert_eq!(decoded, 3);

        // Inserts run on their own tasks.
        wait_for_len(&table, 3).await;

        assert_eq!(table.table.get("100").as_deref(), Some("127.0.0.1:80"));
        assert_eq!(table.table.get("200").as_deref(), Some("[::1]:443"));
        assert_eq!(table.table.get("300").as_deref(), Some("10.0.0.1:22"));
    }

    #[tokio::test]
    async fn test_decoder_skips_invalid_utf8_record() {
        let input: &[u8] = b"1.2.3.4:80:1\n\xff\xfe:80:9\n5.6.7.8:80:2\n";
        let table = Arc::new(FakeRegistry::new(None));
        let registry: Arc<dyn Registry> = table.clone();

        assert_eq!(run_decoder(input, registry).await, 2);
        wait_for_len(&table, 2).await;

        assert_eq!(table.table.get("1").as_deref(), Some("1.2.3.4:80"));
        assert_eq!(table.table.get("2").as_deref(), Some("5.6.7.8:80"));
        assert!(table.table.get("9").is_none());
    }

    #[tokio::test]
    async fn test_pipe_survives_writer_churn() {
        let path = scratch_path();
        let table = Arc::new(FakeRegistry::new(None));
        let registry: Arc<dyn Registry> = table.clone();
        let decoder = tokio::spawn(run_from_path(
            path.to_string_lossy().into_owned(),
            registry,
        ));

        // Each traced process opens, writes one record and exits.
        for record in ["1.2.3.4:80:100\n", "::1:443:200\n"] {
            let mut writer = open_writer(&path).await;
            writer.write_all(record.as_bytes()).await.unwrap();
            drop(writer);
        }

        wait_for_len(&table, 2).await;
        assert_eq!(table.table.get("100").as_deref(), Some("1.2.3.4:80"));
        assert_eq!(table.table.get("200").as_deref(), Some("[::1]:443"));
        assert!(!decoder.is_finished());

        decoder.abort();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_open_pipe_rejects_regular_file() {
        let path = scratch_path();
        std::fs::write(&path, b"").unwrap();

        assert!(open_pipe(&path).is_err());
        let registry: Arc<dyn Registry> = Arc::new(FakeRegistry::new(None));
        assert_eq!(run_from_path(path.to_string_lossy().into_owned(), registry).await, 0);

        std::fs::remove_file(&path).ok();
    }
}
