/*
 * config.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Smistatore, an HTTP connection manager.
 *
 * Smistatore is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Smistatore is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Smistatore.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Connection tuning knobs with their defaults, and an XML file format for them.
//! All XML read/write uses the quick_xml parser/writer; no hand parsing.
//!
//! ```xml
//! <connection>
//!   <channel-count>6</channel-count>
//!   <pipeline-length>3</pipeline-length>
//!   <repipeline-length>2</repipeline-length>
//!   <happy-eyeballs-delay-ms>300</happy-eyeballs-delay-ms>
//!   <bearer>unknown</bearer>
//!   <reconnect-attempts>3</reconnect-attempts>
//!   <user-agent>Mozilla/5.0</user-agent>
//!   <accept-language>en,*</accept-language>
//!   <connection-type>http1</connection-type>
//!   <proxy-host>proxy.example.com</proxy-host>
//!   <proxy-port>3128</proxy-port>
//!   <proxy-user>alice</proxy-user>
//! </connection>
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use crate::error::{Error, Result};

pub const DEFAULT_CHANNEL_COUNT: usize = 6;
pub const DEFAULT_PIPELINE_LENGTH: usize = 3;
pub const DEFAULT_REPIPELINE_LENGTH: usize = 2;
pub const DEFAULT_HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// How requests are carried to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Pool of HTTP/1.1 channels.
    Http1,
    /// Single multiplexed channel negotiated through ALPN; falls back to Http1.
    Multiplexed,
    /// Single multiplexed channel with prior knowledge (no negotiation).
    MultiplexedDirect,
}

impl ConnectionType {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Http1 => "http1",
            ConnectionType::Multiplexed => "multiplexed",
            ConnectionType::MultiplexedDirect => "multiplexed-direct",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http1" => Some(ConnectionType::Http1),
            "multiplexed" => Some(ConnectionType::Multiplexed),
            "multiplexed-direct" => Some(ConnectionType::MultiplexedDirect),
            _ => None,
        }
    }
}

/// Kind of network bearer; slow mobile bearers get a longer happy eyeballs delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerType {
    Unknown,
    Bearer2G,
    Cdma2000,
    Wcdma,
    Hspa,
}

impl BearerType {
    fn as_str(self) -> &'static str {
        match self {
            BearerType::Unknown => "unknown",
            BearerType::Bearer2G => "2g",
            BearerType::Cdma2000 => "cdma2000",
            BearerType::Wcdma => "wcdma",
            BearerType::Hspa => "hspa",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Some(BearerType::Unknown),
            "2g" => Some(BearerType::Bearer2G),
            "cdma2000" => Some(BearerType::Cdma2000),
            "wcdma" => Some(BearerType::Wcdma),
            "hspa" => Some(BearerType::Hspa),
            _ => None,
        }
    }
}

/// HTTP proxy. Plain requests are sent to it with absolute URIs; encrypted
/// connections go through a CONNECT tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxy {
    pub host: String,
    pub port: u16,
    /// Preset credentials, used once the proxy asks for them.
    pub user: String,
    pub password: String,
}

impl HttpProxy {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            user: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Number of HTTP/1.1 channels (physical connections) per host.
    pub channel_count: usize,
    /// Target number of pipelined requests on a channel, excluding the current one.
    pub pipeline_length: usize,
    /// Refill the pipeline only once at least this many slots are free.
    pub repipeline_length: usize,
    /// Bias delay before the non-preferred address family is tried.
    pub happy_eyeballs_delay: Duration,
    pub bearer: BearerType,
    /// Reconnect-and-resend attempts per channel before an error is surfaced.
    pub reconnect_attempts: u32,
    pub user_agent: String,
    pub accept_language: String,
    pub connection_type: ConnectionType,
    pub proxy: Option<HttpProxy>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_count: DEFAULT_CHANNEL_COUNT,
            pipeline_length: DEFAULT_PIPELINE_LENGTH,
            repipeline_length: DEFAULT_REPIPELINE_LENGTH,
            happy_eyeballs_delay: DEFAULT_HAPPY_EYEBALLS_DELAY,
            bearer: BearerType::Unknown,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            user_agent: "Mozilla/5.0".to_string(),
            accept_language: "en,*".to_string(),
            connection_type: ConnectionType::Http1,
            proxy: None,
        }
    }
}

impl ConnectionConfig {
    /// Delay before the second happy eyeballs attempt, adjusted for slow bearers.
    pub fn happy_eyeballs_timeout(&self) -> Duration {
        match self.bearer {
            BearerType::Bearer2G => Duration::from_millis(800),
            BearerType::Cdma2000 | BearerType::Wcdma => Duration::from_millis(500),
            BearerType::Hspa => Duration::from_millis(400),
            BearerType::Unknown => self.happy_eyeballs_delay,
        }
    }

    /// Channels actually used at start: one for multiplexed modes, all of them otherwise.
    pub fn active_channel_count(&self, encrypted: bool) -> usize {
        match self.connection_type {
            ConnectionType::MultiplexedDirect => 1,
            ConnectionType::Multiplexed if encrypted => 1,
            _ => self.channel_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_count == 0 {
            return Err(Error::Config("channel count must be at least 1".to_string()));
        }
        if self.repipeline_length == 0 {
            return Err(Error::Config("repipeline length must be at least 1".to_string()));
        }
        if self.pipeline_length < self.repipeline_length {
            return Err(Error::Config(format!(
                "pipeline length {} is below the refill threshold {}",
                self.pipeline_length, self.repipeline_length
            )));
        }
        if self.user_agent.contains(['\r', '\n']) || self.accept_language.contains(['\r', '\n']) {
            return Err(Error::Config("header values must not contain CR or LF".to_string()));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() {
                return Err(Error::Config("proxy host is empty".to_string()));
            }
            if proxy.port == 0 {
                return Err(Error::Config("proxy port must not be 0".to_string()));
            }
            if proxy.host.contains(['\r', '\n', ' ']) || proxy.user.contains(':') {
                return Err(Error::Config("proxy host or user contains an invalid character".to_string()));
            }
        }
        Ok(())
    }
}

/// Load configuration from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<ConnectionConfig> {
    let content = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConnectionConfig::default()),
        Err(e) => return Err(e.into()),
    };
    parse_config(&content)
}

/// Parse the XML form. Unknown elements are ignored; absent ones keep their defaults.
pub fn parse_config(content: &str) -> Result<ConnectionConfig> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);
    let mut config = ConnectionConfig::default();
    let mut element_name = Vec::<u8>::new();
    let mut in_connection = false;

    loop {
        match reader.read_event() {
            Err(e) => return Err(Error::Xml(e.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = e.name();
                let name = name.as_ref();
                if name == b"connection" {
                    in_connection = true;
                } else if in_connection {
                    element_name.clear();
                    element_name.extend_from_slice(name);
                }
            }
            Ok(Event::Text(e)) => {
                if !in_connection || element_name.is_empty() {
                    continue;
                }
                let text = e.unescape().map_err(|e| Error::Xml(e.to_string()))?;
                apply_value(&mut config, &element_name, text.trim())?;
                element_name.clear();
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"connection" {
                    in_connection = false;
                }
                element_name.clear();
            }
            _ => {}
        }
    }
    config.validate()?;
    Ok(config)
}

fn apply_value(config: &mut ConnectionConfig, name: &[u8], value: &str) -> Result<()> {
    match name {
        b"channel-count" => config.channel_count = parse_number(name, value)?,
        b"pipeline-length" => config.pipeline_length = parse_number(name, value)?,
        b"repipeline-length" => config.repipeline_length = parse_number(name, value)?,
        b"happy-eyeballs-delay-ms" => {
            config.happy_eyeballs_delay = Duration::from_millis(parse_number(name, value)?)
        }
        b"reconnect-attempts" => config.reconnect_attempts = parse_number(name, value)?,
        b"bearer" => {
            config.bearer = BearerType::from_name(value)
                .ok_or_else(|| Error::Config(format!("unknown bearer type: {}", value)))?
        }
        b"user-agent" => config.user_agent = value.to_string(),
        b"accept-language" => config.accept_language = value.to_string(),
        b"connection-type" => {
            config.connection_type = ConnectionType::from_name(value)
                .ok_or_else(|| Error::Config(format!("unknown connection type: {}", value)))?
        }
        b"proxy-host" => proxy_entry(config).host = value.trim_start_matches('[').trim_end_matches(']').to_string(),
        b"proxy-port" => proxy_entry(config).port = parse_number(name, value)?,
        b"proxy-user" => proxy_entry(config).user = value.to_string(),
        b"proxy-password" => proxy_entry(config).password = value.to_string(),
        _ => {}
    }
    Ok(())
}

fn proxy_entry(config: &mut ConnectionConfig) -> &mut HttpProxy {
    config
        .proxy
        .get_or_insert_with(|| HttpProxy::new("", DEFAULT_PROXY_PORT))
}

fn parse_number<T: std::str::FromStr>(name: &[u8], value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        Error::Config(format!(
            "{}: not a number: {}",
            String::from_utf8_lossy(name),
            value
        ))
    })
}

/// Serialize the configuration to XML bytes (UTF-8).
pub fn config_to_xml(config: &ConnectionConfig) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut writer = Writer::new_with_indent(&mut out, b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| Error::Xml(e.to_string()))?;
    writer
        .write_event(Event::Start(BytesStart::new("connection")))
        .map_err(|e| Error::Xml(e.to_string()))?;
    let mut fields: Vec<(&str, String)> = vec![
        ("channel-count", config.channel_count.to_string()),
        ("pipeline-length", config.pipeline_length.to_string()),
        ("repipeline-length", config.repipeline_length.to_string()),
        (
            "happy-eyeballs-delay-ms",
            config.happy_eyeballs_delay.as_millis().to_string(),
        ),
        ("bearer", config.bearer.as_str().to_string()),
        ("reconnect-attempts", config.reconnect_attempts.to_string()),
        ("user-agent", config.user_agent.clone()),
        ("accept-language", config.accept_language.clone()),
        ("connection-type", config.connection_type.as_str().to_string()),
    ];
    if let Some(proxy) = &config.proxy {
        fields.push(("proxy-host", proxy.host.clone()));
        fields.push(("proxy-port", proxy.port.to_string()));
        if !proxy.user.is_empty() {
            fields.push(("proxy-user", proxy.user.clone()));
        }
        if !proxy.password.is_empty() {
            fields.push(("proxy-password", proxy.password.clone()));
        }
    }
    for (name, value) in fields.iter() {
        writer
            .write_event(Event::Start(BytesStart::new(*name)))
            .map_err(|e| Error::Xml(e.to_string()))?;
        writer
            .write_event(Event::Text(BytesText::new(value.as_str())))
            .map_err(|e| Error::Xml(e.to_string()))?;
        writer
            .write_event(Event::End(BytesEnd::new(*name)))
            .map_err(|e| Error::Xml(e.to_string()))?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("connection")))
        .map_err(|e| Error::Xml(e.to_string()))?;
    Ok(out)
}

/// Write the configuration to `path`, creating parent directories as needed.
pub fn save_config(path: &Path, config: &ConnectionConfig) -> Result<()> {
    config.validate()?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let xml = config_to_xml(config)?;
    fs::write(path, xml)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ConnectionConfig::default();
        assert_eq!(c.channel_count, 6);
        assert_eq!(c.pipeline_length, 3);
        assert_eq!(c.repipeline_length, 2);
        assert_eq!(c.happy_eyeballs_timeout(), Duration::from_millis(300));
        assert_eq!(c.reconnect_attempts, 3);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn bearer_adjusts_delay() {
        let mut c = ConnectionConfig::default();
        c.bearer = BearerType::Bearer2G;
        assert_eq!(c.happy_eyeballs_timeout(), Duration::from_millis(800));
        c.bearer = BearerType::Hspa;
        assert_eq!(c.happy_eyeballs_timeout(), Duration::from_millis(400));
    }

    #[test]
    fn multiplexed_uses_one_channel() {
        let mut c = ConnectionConfig::default();
        c.connection_type = ConnectionType::Multiplexed;
        assert_eq!(c.active_channel_count(true), 1);
        assert_eq!(c.active_channel_count(false), 6);
        c.connection_type = ConnectionType::MultiplexedDirect;
        assert_eq!(c.active_channel_count(false), 1);
    }

    #[test]
    fn rejects_bad_values() {
        let mut c = ConnectionConfig::default();
        c.channel_count = 0;
        assert!(c.validate().is_err());
        let mut c = ConnectionConfig::default();
        c.pipeline_length = 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn xml_roundtrip() {
        let mut c = ConnectionConfig::default();
        c.channel_count = 2;
        c.bearer = BearerType::Wcdma;
        c.user_agent = "Smistatore/0.1 <test>".to_string();
        c.connection_type = ConnectionType::Multiplexed;
        let xml = config_to_xml(&c).unwrap();
        let parsed = parse_config(std::str::from_utf8(&xml).unwrap()).unwrap();
        assert_eq!(parsed, c);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let parsed = parse_config("<connection><channel-count>4</channel-count></connection>").unwrap();
        assert_eq!(parsed.channel_count, 4);
        assert_eq!(parsed.pipeline_length, DEFAULT_PIPELINE_LENGTH);
    }

    #[test]
    fn bad_number_is_config_error() {
        let err = parse_config("<connection><channel-count>six</channel-count></connection>").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn proxy_elements() {
        let parsed = parse_config(
            "<connection><proxy-port>3128</proxy-port><proxy-host>proxy.test</proxy-host>\
             <proxy-user>alice</proxy-user></connection>",
        )
        .unwrap();
        let proxy = parsed.proxy.as_ref().unwrap();
        assert_eq!(proxy.host, "proxy.test");
        assert_eq!(proxy.port, 3128);
        assert_eq!(proxy.user, "alice");
        assert_eq!(proxy.password, "");

        let xml = config_to_xml(&parsed).unwrap();
        assert_eq!(parse_config(std::str::from_utf8(&xml).unwrap()).unwrap(), parsed);

        let err = parse_config("<connection><proxy-user>alice</proxy-user></connection>").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("smistatore-config-{}", std::process::id()));
        let path = dir.join("nested").join("connection.xml");
        let mut c = ConnectionConfig::default();
        c.channel_count = 3;
        c.reconnect_attempts = 1;
        c.accept_language = "it,en;q=0.5".to_string();
        save_config(&path, &c).unwrap();
        assert_eq!(load_config(&path).unwrap(), c);

        c.channel_count = 0;
        assert!(matches!(save_config(&path, &c), Err(Error::Config(_))));
        assert_eq!(load_config(&path).unwrap().channel_count, 3);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let c = load_config(Path::new("/nonexistent/smistatore/config.xml")).unwrap();
        assert_eq!(c, ConnectionConfig::default());
    }
}
