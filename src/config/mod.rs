//! Relay configuration
//!
//! A [`Profile`] is the immutable configuration of one relay session. It
//! can come from a JSON config file, from CLI flags, or be imported from
//! an `ss://` URI (both the legacy fully-base64 form and the SIP002 form).

use crate::crypto::Method;
use crate::{Error, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Immutable configuration for a relay session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Optional display name (from an `ss://` URI fragment)
    #[serde(skip)]
    pub name: Option<String>,
    pub server: String,
    pub server_port: u16,
    pub local_address: String,
    pub local_port: u16,
    pub method: String,
    pub password: String,
    /// Idle timeout in seconds
    pub timeout: u64,
    #[serde(skip)]
    pub debug: bool,
    pub http_proxy: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            name: None,
            server: String::new(),
            server_port: 0,
            local_address: "127.0.0.1".to_string(),
            local_port: 0,
            method: String::new(),
            password: String::new(),
            timeout: 600,
            debug: false,
            http_proxy: false,
        }
    }
}

impl Profile {
    /// Load from a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let profile: Profile = serde_json::from_str(&content)?;
        Ok(profile)
    }

    /// Import from an `ss://` URI. Tries the legacy form
    /// (`ss://base64(method:password@host:port)`) first and falls back to
    /// SIP002 (`ss://base64(method:password)@host:port`).
    ///
    /// The result is not validated: unknown methods are kept so that the
    /// caller can report them against the registry.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("ss://")
            .ok_or_else(|| Error::config("not an ss:// URI"))?;

        let (body, fragment) = match rest.split_once('#') {
            Some((b, f)) => (b, Some(f)),
            None => (rest, None),
        };

        let name = match fragment {
            Some(f) => Some(
                urlencoding::decode(f)
                    .map_err(|e| Error::config(format!("invalid URI fragment: {}", e)))?
                    .into_owned(),
            ),
            None => None,
        };

        if let Some(mut profile) = Self::parse_legacy(body) {
            profile.name = name;
            return Ok(profile);
        }

        let mut profile = Self::parse_sip002(uri)?;
        profile.name = name;
        Ok(profile)
    }

    /// Legacy form: the whole authority is one base64 blob
    fn parse_legacy(body: &str) -> Option<Profile> {
        let decoded = decode_base64_lenient(body)?;
        let decoded = String::from_utf8(decoded).ok()?;

        // method:password@host:port, password may itself contain ':' or '@'
        let (userinfo, hostport) = decoded.rsplit_once('@')?;
        let (method, password) = userinfo.split_once(':')?;
        let (host, port) = hostport.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;

        Some(Profile {
            server: host.to_string(),
            server_port: port,
            method: method.to_string(),
            password: password.to_string(),
            ..Default::default()
        })
    }

    /// SIP002 form: standard URI with base64 userinfo
    fn parse_sip002(uri: &str) -> Result<Profile> {
        let url = Url::parse(uri).map_err(|e| Error::config(format!("invalid ss URI: {}", e)))?;

        let userinfo = decode_base64_lenient(url.username())
            .ok_or_else(|| Error::config("invalid base64 user info in ss URI"))?;
        let userinfo = String::from_utf8(userinfo)
            .map_err(|e| Error::config(format!("invalid user info in ss URI: {}", e)))?;
        let (method, password) = userinfo
            .split_once(':')
            .ok_or_else(|| Error::config("ss URI user info must be method:password"))?;

        let host = url
            .host_str()
            .ok_or_else(|| Error::config("ss URI missing host"))?;
        let port = url
            .port()
            .ok_or_else(|| Error::config("ss URI missing port"))?;

        // A plugin query is accepted but not interpreted here
        Ok(Profile {
            server: host.to_string(),
            server_port: port,
            method: method.to_string(),
            password: password.to_string(),
            ..Default::default()
        })
    }

    /// Check the profile against the cipher registry and basic sanity rules
    pub fn validate(&self) -> Result<Method> {
        if self.server.is_empty() {
            return Err(Error::config("server address must not be empty"));
        }
        if self.server_port == 0 {
            return Err(Error::config("server port must not be zero"));
        }
        if self.local_port == 0 {
            return Err(Error::config("local port must not be zero"));
        }
        if self.password.is_empty() {
            return Err(Error::config("password must not be empty"));
        }
        Method::from_name(&self.method)
    }

    /// Idle timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn server_host_port(&self) -> (String, u16) {
        (self.server.clone(), self.server_port)
    }

    pub fn local_host_port(&self) -> (String, u16) {
        (self.local_address.clone(), self.local_port)
    }
}

fn decode_base64_lenient(data: &str) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(decoded) = engine.decode(data.trim()) {
            return Some(decoded);
        }
    }
    None
}
