//! Release record data structures.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// One build artifact as published to the record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    /// Deterministic identifier, see [`build_record_id`]
    pub id: String,

    pub source: Source,

    pub target: Target,

    pub download: Download,

    /// Present once metadata enrichment succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systemaddons: Option<Vec<SystemAddon>>,
}

impl Record {
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    /// Recompute the identifier from the current fields.
    pub fn refresh_id(&mut self) {
        self.id = build_record_id(
            &self.source.product,
            &self.target.channel,
            &self.target.version,
            &self.target.platform,
            &self.target.locale,
            &self.download.url,
        );
    }
}

/// Build provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub product: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<String>,
}

/// What the artifact runs on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub platform: String,
    pub os: Os,
    pub locale: String,
    pub version: String,
    pub channel: String,
}

/// Where the artifact is downloaded from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Download {
    pub url: String,
    pub mimetype: Option<String>,
    pub size: Option<u64>,
    /// `%Y-%m-%dT%H:%M:%SZ`
    pub date: Option<String>,
}

/// Build information taken from the metadata file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Build {
    pub id: String,

    #[serde(default)]
    pub date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,

    /// Compiler and toolchain passthrough fields (`cc`, `cxx`, `as`, `ld`, `host`, `target`)
    #[serde(flatten)]
    pub toolchain: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemAddon {
    pub id: String,
    pub builtin: Option<String>,
    pub updated: Option<String>,
}

/// Coarse operating system family of a platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Win,
    Mac,
    Android,
    Maemo,
}

impl Os {
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Win => "win",
            Os::Mac => "mac",
            Os::Android => "android",
            Os::Maemo => "maemo",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a platform string onto its OS family.
pub fn normalized_platform(platform: &str) -> Result<Os> {
    if platform.contains("eabi") {
        return Ok(Os::Android);
    }
    const FAMILIES: [(&str, Os); 5] = [
        ("linux", Os::Linux),
        ("win", Os::Win),
        ("mac", Os::Mac),
        ("android", Os::Android),
        ("maemo", Os::Maemo),
    ];
    FAMILIES
        .iter()
        .find(|(prefix, _)| platform.contains(prefix))
        .map(|(_, os)| *os)
        .ok_or_else(|| AppError::UnknownPlatform(platform.to_string()))
}

/// Release track of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Release,
    Beta,
    Aurora,
    Esr,
    Nightly,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Release => "release",
            ChannelKind::Beta => "beta",
            ChannelKind::Aurora => "aurora",
            ChannelKind::Esr => "esr",
            ChannelKind::Nightly => "nightly",
        }
    }
}

/// A channel, optionally tagged as an app-store `-old-id` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub kind: ChannelKind,
    pub old_id: bool,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if self.old_id {
            f.write_str("-old-id")?;
        }
        Ok(())
    }
}

impl FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let (base, old_id) = match s.strip_suffix("-old-id") {
            Some(base) => (base, true),
            None => (s, false),
        };
        let kind = match base {
            "release" => ChannelKind::Release,
            "beta" => ChannelKind::Beta,
            "aurora" => ChannelKind::Aurora,
            "esr" => ChannelKind::Esr,
            "nightly" => ChannelKind::Nightly,
            other => return Err(AppError::validation(format!("unknown channel {other:?}"))),
        };
        Ok(Self { kind, old_id })
    }
}

/// Derive the record identifier.
///
/// Nightly builds carry the `YYYY-MM-DD-HH-MM-SS` folder timestamp in front of the
/// version. The channel is an infix unless it is `release`.
pub fn build_record_id(
    product: &str,
    channel: &str,
    version: &str,
    platform: &str,
    locale: &str,
    download_url: &str,
) -> String {
    let mut version = version.to_string();
    if channel.contains("nightly") {
        if let Some(folder) = crate::utils::url::archive_segments(download_url)
            .and_then(|segments| segments.get(4).copied())
        {
            let date = folder.split('-').take(6).collect::<Vec<_>>().join("-");
            version = format!("{date}_{version}");
        }
    }
    let channel = if channel == "release" {
        String::new()
    } else {
        format!("{channel}_")
    };
    format!("{product}_{channel}{version}_{platform}_{locale}")
        .replace('.', "-")
        .to_lowercase()
}

/// Builder validating required fields and deriving `os` and `id`.
#[derive(Debug, Default, Clone)]
pub struct RecordBuilder {
    product: Option<String>,
    channel: Option<String>,
    version: Option<String>,
    platform: Option<String>,
    locale: Option<String>,
    url: Option<String>,
    mimetype: Option<String>,
    size: Option<u64>,
    date: Option<String>,
}

impl RecordBuilder {
    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn channel(mut self, channel: impl ToString) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn mimetype(mut self, mimetype: Option<String>) -> Self {
        self.mimetype = mimetype;
        self
    }

    pub fn size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn date(mut self, date: Option<String>) -> Self {
        self.date = date;
        self
    }

    pub fn build(self) -> Result<Record> {
        let url = require(self.url, "download.url", "")?;
        let product = require(self.product, "source.product", &url)?;
        let channel = require(self.channel, "target.channel", &url)?;
        let version = require(self.version, "target.version", &url)?;
        let platform = require(self.platform, "target.platform", &url)?;
        let locale = require(self.locale, "target.locale", &url)?;
        let os = normalized_platform(&platform)?;

        let mut record = Record {
            id: String::new(),
            source: Source {
                product,
                ..Source::default()
            },
            target: Target {
                platform,
                os,
                locale,
                version,
                channel,
            },
            download: Download {
                url,
                mimetype: self.mimetype,
                size: self.size,
                date: self.date,
            },
            build: None,
            systemaddons: None,
        };
        record.refresh_id();
        Ok(record)
    }
}

fn require(value: Option<String>, field: &str, url: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::parse(url, format!("missing {field}"))),
    }
}
