//! Hikvision snapshot source.
//!
//! Pulls single JPEG snapshots from the ISAPI picture endpoint:
//! `GET http://<host>/ISAPI/Streaming/channels/<channel>/picture`.
//! Channel 301 is the third stream of camera 3 on most NVRs; plain cameras
//! use 101/102.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use url::Url;
use zeroize::Zeroizing;

use super::FrameSource;

const MAX_JPEG_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Clone)]
pub struct CameraConfig {
    /// Host or `scheme://host[:port]`. A bare host gets `http://`.
    pub host: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub channel: u32,
    pub timeout: Duration,
}

impl std::fmt::Debug for CameraConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("channel", &self.channel)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub struct HikvisionCamera {
    agent: ureq::Agent,
    url: Url,
    authorization: Zeroizing<String>,
}

impl HikvisionCamera {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let url = picture_url(&config.host, config.channel)?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.timeout)
            .timeout_read(config.timeout)
            .build();
        Ok(Self {
            agent,
            url,
            authorization: basic_authorization(&config.username, &config.password),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl FrameSource for HikvisionCamera {
    fn fetch(&mut self) -> Result<Option<Vec<u8>>> {
        let response = self
            .agent
            .request_url("GET", &self.url)
            .set("Authorization", self.authorization.as_str())
            .call()
            .with_context(|| format!("fetch snapshot from {}", self.url))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES + 1)
            .read_to_end(&mut bytes)
            .context("read snapshot body")?;
        if bytes.len() as u64 > MAX_JPEG_BYTES {
            return Err(anyhow!(
                "snapshot exceeds {} bytes; refusing to decode",
                MAX_JPEG_BYTES
            ));
        }
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

fn picture_url(host: &str, channel: u32) -> Result<Url> {
    let host = host.trim().trim_end_matches('/');
    if host.is_empty() {
        return Err(anyhow!("camera host is empty"));
    }
    let base = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };
    let url = Url::parse(&format!(
        "{}/ISAPI/Streaming/channels/{}/picture",
        base, channel
    ))
    .with_context(|| format!("parse camera host {:?}", host))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!(
            "unsupported camera scheme '{}'; expected http or https",
            other
        )),
    }
}

fn basic_authorization(username: &str, password: &str) -> Zeroizing<String> {
    let credentials = Zeroizing::new(format!("{}:{}", username, password));
    Zeroizing::new(format!("Basic {}", STANDARD.encode(credentials.as_bytes())))
}
