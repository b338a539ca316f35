//! Telegram adapter (teloxide).
//!
//! Implements the `stb-core` DeliveryClient over the Bot API `sendDocument`
//! method. One upload per call, no retries; the pipeline decides what a
//! failed delivery means for the run.

use std::path::Path;

use async_trait::async_trait;
use teloxide::{prelude::*, types::InputFile};
use tracing::debug;

use stb_core::{config::Config, domain::ChatId, errors::Error, ports::DeliveryClient, Result};

/// Bot API limit for document captions, in characters.
pub const MAX_CAPTION_CHARS: usize = 1024;

#[derive(Clone)]
pub struct TelegramDelivery {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramDelivery {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = teloxide::net::default_reqwest_settings()
            .timeout(cfg.delivery_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build telegram http client: {e}")))?;

        let mut bot = Bot::with_client(cfg.telegram_bot_token.clone(), client);
        if let Some(url) = &cfg.telegram_api_url {
            let url = reqwest::Url::parse(url)
                .map_err(|e| Error::Config(format!("invalid TELEGRAM_API_URL {url:?}: {e}")))?;
            bot = bot.set_api_url(url);
        }

        Ok(Self {
            bot,
            chat_id: cfg.telegram_chat_id,
        })
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Delivery(format!("telegram sendDocument failed: {e}"))
    }
}

#[async_trait]
impl DeliveryClient for TelegramDelivery {
    async fn deliver(&self, artifact: &Path, caption: &str) -> Result<()> {
        let msg = self
            .bot
            .send_document(
                Self::tg_chat(self.chat_id),
                InputFile::file(artifact.to_path_buf()),
            )
            .caption(truncate_caption(caption))
            .await
            .map_err(Self::map_err)?;

        debug!(
            chat_id = self.chat_id.0,
            message_id = msg.id.0,
            artifact = %artifact.display(),
            "document sent"
        );
        Ok(())
    }
}

/// Cut a caption to the Bot API limit on a character boundary.
pub fn truncate_caption(caption: &str) -> String {
    match caption.char_indices().nth(MAX_CAPTION_CHARS) {
        Some((idx, _)) => caption[..idx].to_string(),
        None => caption.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(extra: &[(&str, &str)]) -> Config {
        let mut env: HashMap<String, String> = [
            ("TELEGRAM_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "42"),
            ("SSH_HOST", "backup.example.org"),
            ("SSH_USER", "deploy"),
            ("FILES", r#"{"alpha": "/data/a.sql"}"#),
            ("DELIVERY_TIMEOUT_SECS", "5"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            env.insert(k.to_string(), v.to_string());
        }
        Config::from_lookup(move |k| env.get(k).cloned()).unwrap()
    }

    #[test]
    fn short_captions_are_untouched() {
        assert_eq!(truncate_caption("Project: alpha"), "Project: alpha");
        assert_eq!(truncate_caption(""), "");
    }

    #[test]
    fn long_captions_are_cut_on_char_boundary() {
        let long = "é".repeat(MAX_CAPTION_CHARS + 10);
        let cut = truncate_caption(&long);
        assert_eq!(cut.chars().count(), MAX_CAPTION_CHARS);
        assert!(long.starts_with(&cut));

        let exact = "x".repeat(MAX_CAPTION_CHARS);
        assert_eq!(truncate_caption(&exact), exact);
    }

    #[test]
    fn invalid_api_url_is_a_config_error() {
        let cfg = config(&[("TELEGRAM_API_URL", "not a url")]);
        let err = TelegramDelivery::new(&cfg).err().unwrap();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_api_is_a_delivery_error() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{port}/");
        let delivery = TelegramDelivery::new(&config(&[("TELEGRAM_API_URL", url.as_str())])).unwrap();

        let dir = std::env::temp_dir().join(format!("stb-tg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let artifact = dir.join("a.sql");
        std::fs::write(&artifact, b"select 1;").unwrap();

        let err = delivery.deliver(&artifact, "Project: alpha").await.err().unwrap();
        assert!(matches!(err, Error::Delivery(_)), "got {err:?}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Serve exactly one request: drain it, then answer with `status` and `body`.
    async fn one_shot_server(status: &'static str, body: &'static str) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if request_complete(&buf) {
                    break;
                }
            }
            let resp = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            sock.shutdown().await.unwrap();
        });
        port
    }

    fn request_complete(buf: &[u8]) -> bool {
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let body = &buf[head_end + 4..];
        if let Some(len) = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            return body.len() >= len;
        }
        if head.contains("transfer-encoding: chunked") {
            return body.ends_with(b"0\r\n\r\n");
        }
        true
    }

    #[tokio::test]
    async fn server_error_is_a_delivery_error() {
        let port = one_shot_server("500 Internal Server Error", "upstream unavailable").await;
        let url = format!("http://127.0.0.1:{port}/");
        let delivery = TelegramDelivery::new(&config(&[("TELEGRAM_API_URL", url.as_str())])).unwrap();

        let dir = std::env::temp_dir().join(format!("stb-tg-500-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let artifact = dir.join("alpha.zip");
        std::fs::write(&artifact, b"PK\x03\x04payload").unwrap();

        let err = delivery.deliver(&artifact, "Project: alpha").await.err().unwrap();
        assert!(
            matches!(&err, Error::Delivery(msg) if msg.contains("upstream unavailable")),
            "got {err:?}"
        );
        assert!(artifact.exists(), "adapter must not delete the artifact");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
