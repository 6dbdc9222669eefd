//! Deterministic upload ranking. A pure function of `(uploads, host)`: no
//! I/O, no catalog access, so it's trivially testable against a fixed set
//! of platform/architecture scenarios.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arch {
    X86,
    Amd64,
    Universal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Os {
    Windows,
    Linux,
    MacOs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub os: Os,
    pub is64: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadType {
    Default,
    Html,
    Soundtrack,
    Book,
    Video,
    Documentation,
    Mod,
    AudioAssets,
    GraphicalAssets,
    Sourcecode,
    Other,
}

impl UploadType {
    fn is_native(self) -> bool {
        matches!(self, UploadType::Default | UploadType::Html)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    pub filename: String,
    pub upload_type: UploadType,
    pub platforms: Vec<Os>,
    pub arch: Option<Arch>,
    pub demo: bool,
    pub preorder: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SelectOutcome {
    pub uploads: Vec<Upload>,
    pub original: Vec<Upload>,
    pub had_wrong_format: bool,
    pub had_wrong_arch: bool,
}

const BLACKLISTED_SUFFIXES: [&str; 3] = [".deb", ".rpm", ".pkg"];

/// Runs the full filter/rank pipeline against `uploads` for `host`. Always
/// returns a total, deterministic order; repeated calls with the same
/// input are byte-identical.
pub fn select(uploads: &[Upload], host: &Host) -> SelectOutcome {
    let original = uploads.to_vec();
    let mut had_wrong_format = false;
    let mut had_wrong_arch = false;

    let format_ok: Vec<Upload> = uploads
        .iter()
        .filter(|u| {
            let blacklisted = BLACKLISTED_SUFFIXES.iter().any(|suffix| u.filename.ends_with(suffix));
            if blacklisted {
                had_wrong_format = true;
            }
            !blacklisted
        })
        .cloned()
        .collect();

    let any_tagged_for_host = format_ok.iter().any(|u| u.platforms.contains(&host.os));
    let platform_ok: Vec<Upload> = format_ok
        .into_iter()
        .filter(|u| {
            if u.upload_type == UploadType::Html && u.platforms.is_empty() {
                return true;
            }
            if u.platforms.is_empty() {
                return !any_tagged_for_host;
            }
            u.platforms.contains(&host.os)
        })
        .collect();

    let mut by_platform: std::collections::HashMap<Os, Vec<&Upload>> = std::collections::HashMap::new();
    for upload in &platform_ok {
        for &os in &upload.platforms {
            by_platform.entry(os).or_default().push(upload);
        }
    }

    let arch_ok: Vec<Upload> = platform_ok
        .iter()
        .filter(|upload| {
            let Some(arch) = upload.arch else { return true };
            if arch == Arch::Universal {
                return true;
            }
            let siblings_for_platform: usize = upload
                .platforms
                .iter()
                .map(|os| by_platform.get(os).map(|v| v.len()).unwrap_or(0))
                .max()
                .unwrap_or(1);
            if siblings_for_platform <= 1 {
                return true;
            }
            let matches_host = (arch == Arch::Amd64) == host.is64;
            if !matches_host {
                had_wrong_arch = true;
            }
            matches_host
        })
        .cloned()
        .collect();

    let mut ranked: Vec<(i64, usize, Upload)> = arch_ok
        .into_iter()
        .enumerate()
        .map(|(order, upload)| (score(&upload, host), order, upload))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    SelectOutcome {
        uploads: ranked.into_iter().map(|(_, _, u)| u).collect(),
        original,
        had_wrong_format,
        had_wrong_arch,
    }
}

fn score(upload: &Upload, host: &Host) -> i64 {
    let mut score = 0i64;
    if upload.platforms.len() == 1 && upload.platforms[0] == host.os {
        score += 400;
    }
    if upload.upload_type.is_native() {
        score += 100;
    }
    if upload.demo {
        score -= 500;
    }
    if !upload.preorder {
        score += 50;
    }
    score += filename_heuristic_bonus(upload, host);
    score
}

/// Small tie-break on filename heuristics: a portable build ranks above a
/// naked installer on Windows.
fn filename_heuristic_bonus(upload: &Upload, host: &Host) -> i64 {
    if host.os != Os::Windows {
        return 0;
    }
    let lower = upload.filename.to_ascii_lowercase();
    if lower.contains("portable") {
        2
    } else if lower.contains("setup") || lower.contains("installer") {
        0
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(id: &str, filename: &str, platforms: &[Os], arch: Option<Arch>) -> Upload {
        Upload {
            id: id.into(),
            filename: filename.into(),
            upload_type: UploadType::Default,
            platforms: platforms.to_vec(),
            arch,
            demo: false,
            preorder: false,
        }
    }

    fn typed_upload(id: &str, filename: &str, upload_type: UploadType, platforms: &[Os]) -> Upload {
        Upload { upload_type, ..upload(id, filename, platforms, None) }
    }

    #[test]
    fn scenario_1_format_blacklist() {
        let uploads = vec![
            upload("1", "foo.deb", &[Os::Linux], None),
            upload("2", "bar.rpm", &[Os::Linux], None),
        ];
        let host = Host { os: Os::Linux, is64: true };
        let outcome = select(&uploads, &host);
        assert!(outcome.uploads.is_empty());
        assert!(outcome.had_wrong_format);
        assert!(!outcome.had_wrong_arch);
    }

    #[test]
    fn scenario_2_arch_disambiguation() {
        let uploads = vec![
            upload("1", "game-linux-386.tar.gz", &[Os::Linux], Some(Arch::X86)),
            upload("2", "game-linux-amd64.tar.gz", &[Os::Linux], Some(Arch::Amd64)),
        ];
        let host = Host { os: Os::Linux, is64: true };
        let outcome = select(&uploads, &host);
        assert_eq!(outcome.uploads.len(), 1);
        assert_eq!(outcome.uploads[0].id, "2");
        assert!(outcome.had_wrong_arch);
    }

    #[test]
    fn scenario_3_universal_preserved() {
        let uploads = vec![upload("1", "Linux 32+64bit.tar.bz2", &[Os::Linux], Some(Arch::Universal))];
        let host = Host { os: Os::Linux, is64: false };
        let outcome = select(&uploads, &host);
        assert_eq!(outcome.uploads.len(), 1);
        assert!(!outcome.had_wrong_arch);
        assert!(!outcome.had_wrong_format);
    }

    #[test]
    fn scenario_4_demo_penalty() {
        let mut demo = upload("1", "windows-demo.zip", &[Os::Windows], None);
        demo.demo = true;
        let portable = upload("2", "windows-portable.zip", &[Os::Windows], None);
        let naked = upload("3", "windows-naked.exe", &[Os::Windows], None);
        let uploads = vec![demo, portable, naked];
        let host = Host { os: Os::Windows, is64: false };
        let outcome = select(&uploads, &host);
        let ids: Vec<&str> = outcome.uploads.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn untagged_html_survives_alongside_tagged_uploads() {
        let linux_binary = upload("1", "binary.zip", &[Os::Linux], None);
        let sources = upload("2", "sources.tar.gz", &[Os::Linux, Os::MacOs, Os::Windows], None);
        let html = typed_upload("3", "twine-is-not-a-twemulator.zip", UploadType::Html, &[]);
        let uploads = vec![linux_binary, sources, html];
        let host = Host { os: Os::Linux, is64: true };
        let outcome = select(&uploads, &host);
        let ids: Vec<&str> = outcome.uploads.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"3"));
    }

    #[test]
    fn selection_is_stable_across_repeated_calls() {
        let uploads = vec![
            upload("1", "a.zip", &[Os::Linux], None),
            upload("2", "b.zip", &[Os::Linux], None),
        ];
        let host = Host { os: Os::Linux, is64: true };
        let first = select(&uploads, &host);
        let second = select(&uploads, &host);
        let first_ids: Vec<&str> = first.uploads.iter().map(|u| u.id.as_str()).collect();
        let second_ids: Vec<&str> = second.uploads.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }
}
