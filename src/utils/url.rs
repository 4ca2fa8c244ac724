// src/utils/url.rs

//! Archive URL construction and rewriting.

use std::sync::LazyLock;

use regex::Regex;

/// Artifact extensions worth a record.
pub const FILE_EXTENSIONS: [&str; 6] = ["zip", "tar.gz", "tar.bz2", "dmg", "apk", "exe"];

static ARTIFACT_EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives = FILE_EXTENSIONS
        .iter()
        .map(|ext| regex::escape(ext))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"\.({alternatives})$")).expect("static extension pattern")
});

/// Path segments following the `pub/` root: `[product, kind, ...]`.
///
/// # Examples
/// ```
/// use buildhub::utils::url::archive_segments;
///
/// let segments = archive_segments("https://archive.mozilla.org/pub/firefox/releases/51.0/").unwrap();
/// assert_eq!(segments[..3], ["firefox", "releases", "51.0"]);
/// ```
pub fn archive_segments(url: &str) -> Option<Vec<&str>> {
    let parts: Vec<&str> = url.split('/').collect();
    let root = parts.iter().position(|p| *p == "pub")?;
    Some(parts[root + 1..].to_vec())
}

/// Archive URL of an inventory key (`+` encodes spaces in inventories).
pub fn key_to_archive_url(base_url: &str, key: &str) -> String {
    format!("{}{}", base_url, key.replace('+', " "))
}

/// Which tree of a product folder an archive URL points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFolder<'a> {
    /// `nightly/<path>/`
    Nightly(&'a str),
    /// `candidates[/<version>-candidates]<suffix>`; the suffix starts with `/`
    Candidates(&'a str),
    /// `releases/`
    Releases,
}

/// Build the folder URL for a product, optionally narrowed to version/platform/locale.
pub fn archive_url(
    base_url: &str,
    product: &str,
    version: Option<&str>,
    platform: Option<&str>,
    locale: Option<&str>,
    folder: ArchiveFolder<'_>,
) -> String {
    let product = if product == "fennec" { "mobile" } else { product };
    let platform = platform.map(|p| p.replace("eme", "EME").replace("macosx", "mac"));
    let mut url = format!("{base_url}pub/{product}");

    let push_tail = |url: &mut String| {
        if let Some(platform) = &platform {
            url.push_str(platform);
            url.push('/');
        }
        if let Some(locale) = locale {
            url.push_str(locale);
            url.push('/');
        }
    };

    match folder {
        ArchiveFolder::Nightly(path) => {
            url.push_str("/nightly/");
            url.push_str(path);
            url.push('/');
        }
        ArchiveFolder::Candidates(suffix) => {
            url.push_str("/candidates");
            if let Some(version) = version {
                url.push_str(&format!("/{version}-candidates"));
            }
            url.push_str(suffix);
            push_tail(&mut url);
        }
        ArchiveFolder::Releases => {
            url.push_str("/releases/");
            if let Some(version) = version {
                url.push_str(version);
                url.push('/');
            }
            push_tail(&mut url);
        }
    }
    url
}

/// Rewrite a localized nightly URL to its en-US (or multi-locale, on mobile) build.
///
/// All locales of one nightly share a single metadata file, so this is the cache key.
pub fn localize_nightly_url(url: &str) -> String {
    let url = url.replace("-l10n", "").replace(".installer", "");
    let mut parts: Vec<&str> = url.split('.').collect();
    let from_end = if url.contains("tar") { 4 } else { 3 };
    if parts.len() < from_end {
        return url;
    }
    let locale = if url.contains("/mobile/") && !url.contains("/en-US/") && !url.contains("macosx")
    {
        "multi"
    } else {
        "en-US"
    };
    let index = parts.len() - from_end;
    parts[index] = locale;
    parts.join(".")
}

/// Rewrite a localized candidate URL to its en-US build.
pub fn localize_release_candidate_url(url: &str) -> String {
    let tokens: Vec<&str> = url.split('/').collect();
    if tokens.len() < 2 {
        return url.to_string();
    }
    let lang = tokens[tokens.len() - 2];
    url.replace(&format!(".{lang}."), ".en-US.")
        .replace(&format!("/{lang}/"), "/en-US/")
        .replace("-EME-free", "")
}

/// Swap the artifact extension, e.g. `.tar.bz2` to `.json`.
pub fn replace_artifact_extension(url: &str, extension: &str) -> String {
    ARTIFACT_EXTENSION
        .replace(url, format!(".{extension}").as_str())
        .into_owned()
}

/// Whether a key or URL ends with a known artifact extension.
pub fn has_artifact_extension(key: &str) -> bool {
    FILE_EXTENSIONS
        .iter()
        .any(|ext| key.ends_with(&format!(".{ext}")))
}

/// Mimetype of an artifact from its last extension.
pub fn guess_mimetype(url: &str) -> Option<String> {
    let (_, ext) = url.rsplit_once('.')?;
    let mimetype = match ext {
        "apk" => "application/vnd.android.package-archive",
        "bz2" => "application/x-bzip2",
        "zip" => "application/zip",
        "dmg" => "application/x-apple-diskimage",
        "gz" => "application/x-gzip",
        "exe" => "application/msdos-windows",
        _ => return None,
    };
    Some(mimetype.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARCHIVE: &str = "https://archive.mozilla.org/";

    #[test]
    fn test_archive_segments_requires_pub_root() {
        assert!(archive_segments("https://example.com/firefox/").is_none());
        let segments =
            archive_segments("https://archive.mozilla.org/pub/mobile/nightly/2017/05/").unwrap();
        assert_eq!(segments[0], "mobile");
        assert_eq!(segments[1], "nightly");
    }

    #[test]
    fn test_key_to_archive_url() {
        assert_eq!(
            key_to_archive_url(ARCHIVE, "pub/firefox/releases/51.0/win64/fy-NL/Firefox+Setup+51.0.exe"),
            "https://archive.mozilla.org/pub/firefox/releases/51.0/win64/fy-NL/Firefox Setup 51.0.exe"
        );
    }

    #[test]
    fn test_archive_url_variants() {
        assert_eq!(
            archive_url(ARCHIVE, "fennec", None, None, None, ArchiveFolder::Candidates("/")),
            "https://archive.mozilla.org/pub/mobile/candidates/"
        );
        assert_eq!(
            archive_url(
                ARCHIVE,
                "firefox",
                Some("50.0"),
                None,
                None,
                ArchiveFolder::Candidates("/")
            ),
            "https://archive.mozilla.org/pub/firefox/candidates/50.0-candidates/"
        );
        assert_eq!(
            archive_url(
                ARCHIVE,
                "firefox",
                Some("56.0"),
                Some("macosx"),
                Some("en-US"),
                ArchiveFolder::Candidates("/build3/")
            ),
            "https://archive.mozilla.org/pub/firefox/candidates/56.0-candidates/build3/mac/en-US/"
        );
        assert_eq!(
            archive_url(
                ARCHIVE,
                "firefox",
                Some("51.0"),
                Some("win64"),
                None,
                ArchiveFolder::Releases
            ),
            "https://archive.mozilla.org/pub/firefox/releases/51.0/win64/"
        );
        assert_eq!(
            archive_url(
                ARCHIVE,
                "firefox",
                None,
                None,
                None,
                ArchiveFolder::Nightly("2017/05")
            ),
            "https://archive.mozilla.org/pub/firefox/nightly/2017/05/"
        );
    }

    #[test]
    fn test_localize_nightly_url() {
        let localized = "https://archive.mozilla.org/pub/firefox/nightly/2017/05/2017-05-15-10-02-38-mozilla-central-l10n/firefox-55.0a1.ach.linux-x86_64.tar.bz2";
        let canonical = "https://archive.mozilla.org/pub/firefox/nightly/2017/05/2017-05-15-10-02-38-mozilla-central/firefox-55.0a1.en-US.linux-x86_64.tar.bz2";
        assert_eq!(localize_nightly_url(localized), canonical);
        assert_eq!(localize_nightly_url(canonical), canonical);
    }

    #[test]
    fn test_localize_nightly_url_locales_collapse() {
        let fr = "https://archive.mozilla.org/pub/firefox/nightly/2017/06/2017-06-16-03-02-07-mozilla-central-l10n/firefox-56.0a1.fr.win32.installer.exe";
        let de = "https://archive.mozilla.org/pub/firefox/nightly/2017/06/2017-06-16-03-02-07-mozilla-central-l10n/firefox-56.0a1.de.win32.installer.exe";
        assert_eq!(localize_nightly_url(fr), localize_nightly_url(de));
        assert_eq!(
            localize_nightly_url(fr),
            "https://archive.mozilla.org/pub/firefox/nightly/2017/06/2017-06-16-03-02-07-mozilla-central/firefox-56.0a1.en-US.win32.exe"
        );
    }

    #[test]
    fn test_localize_nightly_url_mobile_multi() {
        assert_eq!(
            localize_nightly_url(
                "https://archive.mozilla.org/pub/mobile/nightly/2017/05/2017-05-15-10-02-38-mozilla-central-android-api-15-l10n/fennec-55.0a1.ar.android-arm.apk"
            ),
            "https://archive.mozilla.org/pub/mobile/nightly/2017/05/2017-05-15-10-02-38-mozilla-central-android-api-15/fennec-55.0a1.multi.android-arm.apk"
        );
    }

    #[test]
    fn test_localize_release_candidate_url() {
        assert_eq!(
            localize_release_candidate_url(
                "https://archive.mozilla.org/pub/firefox/candidates/52.0.2-candidates/build1/linux-x86_64-EME-free/cak/firefox-52.0.2.tar.bz2"
            ),
            "https://archive.mozilla.org/pub/firefox/candidates/52.0.2-candidates/build1/linux-x86_64/en-US/firefox-52.0.2.tar.bz2"
        );
    }

    #[test]
    fn test_replace_artifact_extension() {
        assert_eq!(
            replace_artifact_extension("https://a/pub/firefox-55.0a1.en-US.linux-x86_64.tar.bz2", "json"),
            "https://a/pub/firefox-55.0a1.en-US.linux-x86_64.json"
        );
        assert_eq!(
            replace_artifact_extension("https://a/pub/fennec-55.0a1.multi.android-arm.apk", "txt"),
            "https://a/pub/fennec-55.0a1.multi.android-arm.txt"
        );
    }

    #[test]
    fn test_guess_mimetype() {
        assert_eq!(
            guess_mimetype("firefox-1.0rc1.ca-AD.linux-i686.installer.tar.gz").as_deref(),
            Some("application/x-gzip")
        );
        assert_eq!(
            guess_mimetype("Firefox Setup 51.0.exe").as_deref(),
            Some("application/msdos-windows")
        );
        assert_eq!(
            guess_mimetype("fennec-55.0a1.multi.android-arm.apk").as_deref(),
            Some("application/vnd.android.package-archive")
        );
        assert!(guess_mimetype("firefox-52.0.tar.bz2.asc").is_none());
    }

    #[test]
    fn test_has_artifact_extension() {
        assert!(has_artifact_extension("pub/firefox/releases/51.0/mac/en-US/Firefox 51.0.dmg"));
        assert!(has_artifact_extension("pub/firefox/a.tar.gz"));
        assert!(!has_artifact_extension("pub/firefox/a.tar.gz.asc"));
        assert!(!has_artifact_extension("pub/firefox/a.json"));
    }
}
