// src/services/canonical.rs

//! Canonicalizer: archive URLs to release records.
//!
//! Everything here is pure. The archive layout is positional:
//!
//! ```text
//! pub/<product>/nightly/YYYY/MM/<timestamp>-<tree>[-l10n]/<file>
//! pub/<product>/candidates/<version>-candidates/build<N>/<platform>/<locale>/<file>
//! pub/<product>/releases/<version>/<platform>/<locale>/<file>
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::error::{AppError, Result};
use crate::models::{Build, Channel, ChannelKind, Metadata, Record};
use crate::utils::url::{FILE_EXTENSIONS, archive_segments, guess_mimetype};

/// Output format of record dates.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Toolchain fields copied from metadata, with their record names.
const TOOLCHAIN_FIELDS: [(&str, &str); 6] = [
    ("as", "as"),
    ("cc", "cc"),
    ("cxx", "cxx"),
    ("ld", "ld"),
    ("host_alias", "host"),
    ("target_alias", "target"),
];

static EXCLUDED_PATHS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^.+(tinderbox|try-builds|partner-repacks|latest|contrib|/0\.|experimental|namoroka",
        r"|debug|sha1-installers|candidates/archived|stylo-bindings|/1\.0rc/|/releases/win../",
        r"|dominspector|/test/|testing|%28.+%29|\sInstaller\.(\w{2,3}-?\w{0,3})\.exe)",
    ))
    .expect("static exclusion pattern")
});

static EXCLUDED_SUFFIXES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+(sdk|tests|crashreporter|stub|gtk2.+xft|source|asan)")
        .expect("static suffix pattern")
});

static BUILD_FOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/build(\d+)/").expect("static build folder pattern"));

static CHANNEL_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(release|aurora|beta|esr|nightly)(-old-id)?$").expect("static channel pattern")
});
static PLATFORM_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(win|mac|linux|android|maemo|eabi).{0,4}").expect("static platform pattern")
});
static LOCALE_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z]{2,3}-?){1,3}$").expect("static locale pattern")
});
static VERSION_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+|\.|-|esr|rc|b|a|pre|funnelcake|real|plugin)+$")
        .expect("static version pattern")
});

/// File-name prefix of a product's artifacts.
fn file_product(product: &str) -> &str {
    match product {
        "devedition" => "firefox",
        "mobile" => "fennec",
        other => other,
    }
}

/// Guess the release channel from the URL and version.
///
/// A `nightly` path wins, then `aurora` in the path, then a beta marker in the
/// version (Developer Edition betas are aurora), then an `esr` suffix.
pub fn guess_channel(url: &str, version: &str) -> Channel {
    let kind = if url.contains("nightly") {
        if url.contains("aurora") {
            ChannelKind::Aurora
        } else {
            ChannelKind::Nightly
        }
    } else if url.contains("aurora") {
        ChannelKind::Aurora
    } else if version.contains('b') {
        if url.contains("devedition") {
            ChannelKind::Aurora
        } else {
            ChannelKind::Beta
        }
    } else if version.ends_with("esr") {
        ChannelKind::Esr
    } else {
        ChannelKind::Release
    };

    Channel {
        kind,
        old_id: url.contains("old-id"),
    }
}

/// Whether an archive URL points at an installable build of `product`.
pub fn is_build_url(product: &str, url: &str) -> bool {
    if url.contains("nightly") && !url.contains("mozilla-central") && !url.contains("comm-central")
    {
        return false;
    }
    if EXCLUDED_PATHS.is_match(url) {
        return false;
    }

    let extensions: Vec<String> = FILE_EXTENSIONS
        .iter()
        .filter(|ext| !(url.contains("win") && **ext == "zip"))
        .map(|ext| regex::escape(ext))
        .collect();

    let filename = url
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .replace(' ', "-")
        .to_lowercase();
    if EXCLUDED_SUFFIXES.is_match(&filename) {
        return false;
    }

    let pattern = format!(
        r"^{}-(.+)({})$",
        regex::escape(file_product(product)),
        extensions.join("|")
    );
    Regex::new(&pattern).is_ok_and(|re| re.is_match(&filename))
}

/// Whether `filename` is the release metadata file of `product` `version`.
pub fn is_release_build_metadata(product: &str, version: &str, filename: &str) -> bool {
    let product = if product == "devedition" {
        "firefox"
    } else {
        product
    };
    let pattern = format!(
        r"^{}-{}(.*)\.json$",
        regex::escape(product),
        regex::escape(version)
    );
    Regex::new(&pattern).is_ok_and(|re| re.is_match(filename))
}

/// Build number encoded as `/build<N>/` in a candidate URL.
pub fn build_number_from_url(url: &str) -> Option<u32> {
    BUILD_FOLDER
        .captures(url)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse an archive URL into a record.
///
/// Size and date are left empty; they come from the inventory or listing.
pub fn record_from_url(url: &str) -> Result<Record> {
    let normalized = url.replace(' ', "-").to_lowercase();
    let segments = archive_segments(&normalized)
        .ok_or_else(|| AppError::parse(url, "not under the archive pub/ root"))?;
    let at = |index: usize| {
        segments
            .get(index)
            .copied()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::parse(url, format!("missing path segment {index}")))
    };

    let product = match at(0)? {
        "mobile" => "fennec",
        other => other,
    };
    let filename = *segments
        .last()
        .ok_or_else(|| AppError::parse(url, "no filename"))?;

    let (version, platform, locale) = if url.contains("nightly") {
        let (version, locale, mut platform) = parse_dotted_filename(url, filename)?;
        let folder = at(4)?;
        if folder.contains("android-api") {
            let parts: Vec<&str> = folder.split('-').collect();
            if parts.len() >= 11 {
                platform = parts[8..11].join("-");
            }
        }
        (version, platform, locale)
    } else if url.contains("candidates") {
        let version = at(2)?.replace("-candidates", "");
        let build = at(3)?.replace("build", "");
        let mut version = format!("{version}rc{build}");
        let mut platform = at(4)?.to_string();
        let mut locale = at(5)?.to_string();
        if platform.contains("funnelcake") {
            version = format!("{version}-{platform}");
            platform = at(5)?.to_string();
            locale = at(6)?.to_string();
        }
        (version, platform, locale)
    } else if segments.len() < 5 {
        // Early releases sit flat in releases/<version>/
        let (version, locale, platform) = parse_dotted_filename(url, filename)?;
        (version, platform, locale)
    } else if url.contains("funnelcake") && segments.len() == 7 {
        (at(2)?.to_string(), at(4)?.to_string(), at(5)?.to_string())
    } else {
        (at(2)?.to_string(), at(3)?.to_string(), at(4)?.to_string())
    };

    let platform = if platform.starts_with("mac") {
        platform.replace("mac", "macosx")
    } else {
        platform
    };
    let channel = guess_channel(url, &version);

    Record::builder()
        .product(product)
        .channel(channel)
        .version(version)
        .platform(platform)
        .locale(normalize_locale(&locale))
        .url(url)
        .mimetype(guess_mimetype(url))
        .build()
}

/// `<product>-<major>.<minor>.<locale>.<platform>...` into (version, locale, platform).
fn parse_dotted_filename(url: &str, filename: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = filename.split('.').collect();
    if parts.len() < 4 {
        return Err(AppError::parse(url, "unexpected filename layout"));
    }
    let major = parts[0]
        .split('-')
        .nth(1)
        .ok_or_else(|| AppError::parse(url, "filename lacks a version"))?;
    Ok((
        format!("{major}.{}", parts[1]),
        parts[2].to_string(),
        parts[3].to_string(),
    ))
}

/// Region part of a locale is upper-cased: `fr-fr` to `fr-FR`, `ja-jp-mac` to `ja-JP-mac`.
fn normalize_locale(locale: &str) -> String {
    let mut parts: Vec<String> = locale.split('-').map(str::to_string).collect();
    if parts.len() > 1 {
        parts[1] = parts[1].to_uppercase();
    }
    parts.join("-")
}

/// Strict sanity checks on a record's shape.
pub fn check_record(record: &Record) -> Result<()> {
    if record.build.as_ref().is_none_or(|b| b.id.is_empty()) {
        return Err(AppError::validation(format!("{}: missing build id", record.id)));
    }
    let checks = [
        ("channel", &CHANNEL_SHAPE, &record.target.channel),
        ("platform", &PLATFORM_SHAPE, &record.target.platform),
        ("locale", &LOCALE_SHAPE, &record.target.locale),
        ("version", &VERSION_SHAPE, &record.target.version),
    ];
    for (field, shape, value) in checks {
        if !shape.is_match(value) {
            return Err(AppError::validation(format!(
                "{}: unexpected {field} {value:?}",
                record.id
            )));
        }
    }
    Ok(())
}

/// Fold fetched metadata into a record.
///
/// Absent metadata leaves the record untouched. A declared update channel overrides the
/// guessed one, in which case the id is derived again from the new channel.
pub fn merge_metadata(mut record: Record, metadata: Option<&Metadata>) -> Record {
    let Some(metadata) = metadata else {
        return record;
    };

    if let Some(channel) = metadata.get_str("moz_update_channel") {
        if channel != record.target.channel {
            record.target.channel = channel;
            record.refresh_id();
        }
    }

    if let Some(repository) = metadata.get_str("moz_source_repo") {
        let repository = repository.replace("MOZ_SOURCE_REPO=", "");
        let tree = repository
            .rsplit_once("hg.mozilla.org/")
            .map_or(repository.as_str(), |(_, tree)| tree)
            .to_string();
        record.source.repository = Some(repository);
        record.source.tree = Some(tree);
    }
    if let Some(revision) = metadata.get_str("moz_source_stamp") {
        record.source.revision = Some(revision);
    }

    if let Some(buildid) = metadata.get_str("buildid") {
        let toolchain: BTreeMap<String, String> = TOOLCHAIN_FIELDS
            .iter()
            .filter_map(|(from, to)| metadata.get_str(from).map(|v| (to.to_string(), v)))
            .collect();
        record.build = Some(Build {
            date: parse_build_date(&buildid),
            id: buildid,
            number: metadata.get_u32("buildnumber"),
            toolchain,
        });
    }
    record
}

/// `YYYYMMDDHHMMSS...` to the record date format.
fn parse_build_date(buildid: &str) -> Option<String> {
    let stamp = buildid.get(..14)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.format(DATETIME_FORMAT).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ARCHIVE: &str = "https://archive.mozilla.org/pub/";

    fn id_of(path: &str) -> String {
        record_from_url(&format!("{ARCHIVE}{path}")).unwrap().id
    }

    #[test]
    fn test_release_record() {
        let record =
            record_from_url(&format!("{ARCHIVE}firefox/releases/51.0/win64/fy-NL/Firefox Setup 51.0.exe"))
                .unwrap();
        assert_eq!(record.id, "firefox_51-0_win64_fy-nl");
        assert_eq!(record.source.product, "firefox");
        assert_eq!(record.target.locale, "fy-NL");
        assert_eq!(record.target.channel, "release");
        assert_eq!(
            record.download.mimetype.as_deref(),
            Some("application/msdos-windows")
        );
        assert!(record.download.url.contains("Firefox Setup 51.0.exe"));
    }

    #[test]
    fn test_record_ids_across_layouts() {
        let cases = [
            (
                "firefox/nightly/2017/05/2017-05-15-10-02-38-mozilla-central/firefox-55.0a1.en-US.linux-x86_64.tar.bz2",
                "firefox_nightly_2017-05-15-10-02-38_55-0a1_linux-x86_64_en-us",
            ),
            (
                "firefox/nightly/2017/04/2017-04-03-00-40-02-mozilla-aurora/firefox-54.0a2.en-US.mac.dmg",
                "firefox_aurora_54-0a2_macosx_en-us",
            ),
            (
                "devedition/releases/55.0b3/mac/en-US/Firefox 55.0b3.dmg",
                "devedition_aurora_55-0b3_macosx_en-us",
            ),
            (
                "firefox/releases/52.0b6/linux-x86_64/en-US/firefox-52.0b6.tar.bz2",
                "firefox_beta_52-0b6_linux-x86_64_en-us",
            ),
            (
                "firefox/candidates/50.0-candidates/build1/linux-x86_64/fr/firefox-50.0.tar.bz2",
                "firefox_50-0rc1_linux-x86_64_fr",
            ),
            (
                "firefox/candidates/55.0b9-candidates/build2/win64/zh-TW/Firefox Setup 55.0b9.exe",
                "firefox_beta_55-0b9rc2_win64_zh-tw",
            ),
            (
                "firefox/releases/52.0esr/linux-x86_64/en-US/firefox-52.0esr.tar.bz2",
                "firefox_esr_52-0esr_linux-x86_64_en-us",
            ),
            (
                "firefox/releases/16.0b6/win32/bs/Firefox Setup 16.0b6.exe",
                "firefox_beta_16-0b6_win32_bs",
            ),
            (
                "firefox/releases/50.0.1/mac/ko/Firefox 50.0.1.dmg",
                "firefox_50-0-1_macosx_ko",
            ),
            (
                "firefox/releases/56.0/mac-EME-free/br/Firefox 56.0.dmg",
                "firefox_56-0_macosx-eme-free_br",
            ),
            (
                "firefox/releases/22.0-funnelcake23/linux-i686/id/firefox-22.0.tar.bz2",
                "firefox_22-0-funnelcake23_linux-i686_id",
            ),
            (
                "firefox/releases/56.0.1-funnelcake131/v1/win64/en-US/Firefox Setup 56.0.1.exe",
                "firefox_56-0-1-funnelcake131_win64_en-us",
            ),
            (
                "firefox/candidates/49.0.1-candidates/build3/funnelcake90/win32/en-US/Firefox Setup 49.0.1.exe",
                "firefox_49-0-1rc3-funnelcake90_win32_en-us",
            ),
            (
                "firefox/releases/1.0rc1/firefox-1.0rc1.ca-AD.linux-i686.installer.tar.gz",
                "firefox_1-0rc1_linux-i686_ca-ad",
            ),
        ];
        for (path, expected) in cases {
            assert_eq!(id_of(path), expected, "for {path}");
        }
    }

    #[test]
    fn test_record_id_is_stable() {
        let url = format!(
            "{ARCHIVE}firefox/candidates/50.0-candidates/build1/linux-x86_64/fr/firefox-50.0.tar.bz2"
        );
        let first = record_from_url(&url).unwrap();
        let second = record_from_url(&url).unwrap();
        assert_eq!(first.id, second.id);
        let mut copy = first.clone();
        copy.refresh_id();
        assert_eq!(copy.id, first.id);
    }

    #[test]
    fn test_mobile_nightly_api_platform() {
        let record = record_from_url(&format!(
            "{ARCHIVE}mobile/nightly/2017/05/2017-05-30-10-01-27-mozilla-central-android-api-15/fennec-55.0a1.multi.android-arm.apk"
        ))
        .unwrap();
        assert_eq!(record.source.product, "fennec");
        assert_eq!(record.target.platform, "android-api-15");
        assert_eq!(record.target.locale, "multi");
        assert_eq!(record.target.channel, "nightly");
    }

    #[test]
    fn test_old_id_channel() {
        let record = record_from_url(&format!(
            "{ARCHIVE}mobile/nightly/2017/05/2017-05-30-10-01-27-mozilla-central-android-x86-old-id/fennec-55.0a1.multi.android-i386.apk"
        ))
        .unwrap();
        assert_eq!(record.target.channel, "nightly-old-id");
    }

    #[test]
    fn test_unknown_layout_is_parse_error() {
        assert!(matches!(
            record_from_url("https://example.com/firefox.exe"),
            Err(AppError::Parse { .. })
        ));
        assert!(matches!(
            record_from_url(&format!("{ARCHIVE}firefox/releases/51.0/namokora/fr/firefox-51.0.zip")),
            Err(AppError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn test_guess_channel_precedence() {
        let nightly = "https://a/pub/firefox/nightly/2017/2017-mozilla-central/";
        assert_eq!(guess_channel(nightly, "55.0b1").kind, ChannelKind::Nightly);
        assert_eq!(
            guess_channel("https://a/pub/firefox/releases/55.0b1/", "55.0b1").kind,
            ChannelKind::Beta
        );
        assert_eq!(
            guess_channel("https://a/pub/devedition/releases/55.0b1/", "55.0b1").kind,
            ChannelKind::Aurora
        );
        assert_eq!(
            guess_channel("https://a/pub/firefox/releases/52.0esr/", "52.0esr").kind,
            ChannelKind::Esr
        );
        assert_eq!(
            guess_channel("https://a/pub/firefox/releases/52.0/", "52.0").to_string(),
            "release"
        );
    }

    #[test]
    fn test_is_build_url() {
        let accepted = [
            ("firefox", "firefox/releases/51.0/win64/fy-NL/Firefox Setup 51.0.exe"),
            ("firefox", "firefox/releases/51.0/linux-x86_64/fr/firefox-51.0.tar.bz2"),
            ("devedition", "devedition/releases/55.0b3/mac/en-US/Firefox 55.0b3.dmg"),
            ("mobile", "mobile/releases/55.0/android-api-15/fr/fennec-55.0.fr.android-arm.apk"),
            (
                "firefox",
                "firefox/nightly/2017/05/2017-05-15-10-02-38-mozilla-central/firefox-55.0a1.en-US.linux-x86_64.tar.bz2",
            ),
        ];
        for (product, path) in accepted {
            assert!(is_build_url(product, &format!("{ARCHIVE}{path}")), "{path}");
        }

        let rejected = [
            ("firefox", "firefox/releases/51.0/win64/fy-NL/firefox-51.0.zip"),
            ("firefox", "firefox/releases/51.0/source/firefox-51.0.source.tar.xz"),
            ("firefox", "firefox/releases/51.0/linux-x86_64/fr/firefox-51.0.tar.bz2.asc"),
            ("firefox", "firefox/releases/51.0/win32/fr/Firefox Installer.fr.exe"),
            ("firefox", "firefox/releases/51.0/linux-i686/en-US/firefox-51.0.tests.zip"),
            ("firefox", "firefox/releases/latest/linux-i686/en-US/firefox-51.0.tar.bz2"),
            ("firefox", "firefox/tinderbox-builds/linux-i686/firefox-51.0.tar.bz2"),
            (
                "firefox",
                "firefox/nightly/2017/05/2017-05-15-10-02-38-mozilla-aurora/firefox-54.0a2.en-US.mac.dmg",
            ),
            ("firefox", "firefox/releases/51.0/mac/en-US/Thunderbird 51.0.dmg"),
        ];
        for (product, path) in rejected {
            assert!(!is_build_url(product, &format!("{ARCHIVE}{path}")), "{path}");
        }
    }

    #[test]
    fn test_is_release_build_metadata() {
        assert!(is_release_build_metadata("firefox", "51.0", "firefox-51.0.json"));
        assert!(is_release_build_metadata(
            "devedition",
            "55.0b3",
            "firefox-55.0b3.en-US.mac.json"
        ));
        assert!(!is_release_build_metadata("firefox", "51.0", "firefox-51.0.txt"));
        assert!(!is_release_build_metadata("firefox", "51.0", "firefox-51.0.1.json.asc"));
    }

    #[test]
    fn test_build_number_from_url() {
        assert_eq!(
            build_number_from_url("https://a/pub/firefox/candidates/50.0-candidates/build12/x"),
            Some(12)
        );
        assert_eq!(build_number_from_url("https://a/pub/firefox/releases/50.0/"), None);
    }

    fn complete_record() -> Record {
        let record =
            record_from_url(&format!("{ARCHIVE}firefox/releases/51.0/win64/fy-NL/Firefox Setup 51.0.exe"))
                .unwrap();
        let metadata = Metadata::from_value(json!({
            "buildid": "20170118123726",
            "moz_source_repo": "MOZ_SOURCE_REPO=https://hg.mozilla.org/releases/mozilla-release",
            "moz_source_stamp": "ea82b5e20cbbd103f8fa65f0df0386ee4135cc47",
            "moz_update_channel": "release",
            "buildnumber": 3,
            "cc": "cl.exe",
            "host_alias": "x86_64-pc-mingw32",
        }))
        .unwrap();
        merge_metadata(record, Some(&metadata))
    }

    #[test]
    fn test_merge_metadata() {
        let record = complete_record();
        assert_eq!(record.id, "firefox_51-0_win64_fy-nl");
        assert_eq!(
            record.source.repository.as_deref(),
            Some("https://hg.mozilla.org/releases/mozilla-release")
        );
        assert_eq!(record.source.tree.as_deref(), Some("releases/mozilla-release"));
        assert_eq!(
            record.source.revision.as_deref(),
            Some("ea82b5e20cbbd103f8fa65f0df0386ee4135cc47")
        );
        let build = record.build.as_ref().unwrap();
        assert_eq!(build.id, "20170118123726");
        assert_eq!(build.date.as_deref(), Some("2017-01-18T12:37:26Z"));
        assert_eq!(build.number, Some(3));
        assert_eq!(build.toolchain.get("cc").map(String::as_str), Some("cl.exe"));
        assert_eq!(
            build.toolchain.get("host").map(String::as_str),
            Some("x86_64-pc-mingw32")
        );
        assert!(check_record(&record).is_ok());
    }

    #[test]
    fn test_merge_none_is_identity() {
        let record = record_from_url(&format!(
            "{ARCHIVE}firefox/candidates/50.0-candidates/build1/linux-x86_64/fr/firefox-50.0.tar.bz2"
        ))
        .unwrap();
        assert_eq!(merge_metadata(record.clone(), None), record);
    }

    #[test]
    fn test_merge_channel_override_refreshes_id() {
        let record = record_from_url(&format!(
            "{ARCHIVE}firefox/releases/55.0b3/linux-x86_64/en-US/firefox-55.0b3.tar.bz2"
        ))
        .unwrap();
        let metadata = Metadata::from_value(json!({"moz_update_channel": "aurora"})).unwrap();
        let merged = merge_metadata(record, Some(&metadata));
        assert_eq!(merged.target.channel, "aurora");
        assert_eq!(merged.id, "firefox_aurora_55-0b3_linux-x86_64_en-us");
        assert!(merged.build.is_none());
    }

    #[test]
    fn test_short_buildid_has_no_date() {
        assert_eq!(parse_build_date("2017011812"), None);
        assert_eq!(
            parse_build_date("20170118123726").as_deref(),
            Some("2017-01-18T12:37:26Z")
        );
    }

    #[test]
    fn test_check_record_rejects_incomplete_and_bad_shapes() {
        let incomplete = record_from_url(&format!(
            "{ARCHIVE}firefox/releases/51.0/win64/fy-NL/Firefox Setup 51.0.exe"
        ))
        .unwrap();
        assert!(matches!(
            check_record(&incomplete),
            Err(AppError::Validation(_))
        ));

        let mut bad_locale = complete_record();
        bad_locale.target.locale = "fy_NL".to_string();
        assert!(check_record(&bad_locale).is_err());

        let mut bad_channel = complete_record();
        bad_channel.target.channel = "candidate".to_string();
        assert!(check_record(&bad_channel).is_err());
    }
}
