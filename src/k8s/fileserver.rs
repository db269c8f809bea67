use crate::config::FileserverConfig;
use crate::scheduler::{DirectoryEntry, EntryType};
use serde::Deserialize;
use tracing::debug;

/// Listing entry as the fileserver sidecar reports it.
#[derive(Debug, Deserialize)]
struct RawEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: String,
    size: Option<u64>,
}

/// Normalize a request path to `/segment/…/` form.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

fn annotate(entries: Vec<RawEntry>, base_url: &str, path: &str) -> Vec<DirectoryEntry> {
    entries
        .into_iter()
        .map(|entry| {
            if entry.entry_type == "directory" {
                DirectoryEntry {
                    path: Some(format!("{path}{}", entry.name)),
                    name: entry.name,
                    entry_type: EntryType::Directory,
                    size: entry.size,
                    url: None,
                }
            } else {
                DirectoryEntry {
                    url: Some(format!("{base_url}{}", entry.name)),
                    name: entry.name,
                    entry_type: EntryType::File,
                    size: entry.size,
                    path: None,
                }
            }
        })
        .collect()
}

/// List one sandbox directory through the instance's fileserver sidecar.
/// Any transport or decode problem yields `None`; browsing is best-effort.
pub async fn retrieve_directory_content(
    config: &FileserverConfig,
    http: &reqwest::Client,
    host: &str,
    path: &str,
) -> Option<Vec<DirectoryEntry>> {
    let port = config.port?;
    let path = normalize_path(path);
    let base_url = format!("{}://{host}:{port}{path}", config.scheme);
    let response = match http.get(&base_url).send().await {
        Ok(response) => response,
        Err(err) => {
            debug!("fileserver request to {base_url} failed: {err}");
            return None;
        }
    };
    if !response.status().is_success() {
        debug!("fileserver at {base_url} returned {}", response.status());
        return None;
    }
    match response.json::<Vec<RawEntry>>().await {
        Ok(entries) => Some(annotate(entries, &base_url, &path)),
        Err(err) => {
            debug!("fileserver listing from {base_url} undecodable: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("r0"), "/r0/");
        assert_eq!(normalize_path("/r0/logs/"), "/r0/logs/");
    }

    #[test]
    fn test_annotate_files_and_directories() {
        let raw = vec![
            RawEntry {
                name: "stdout".to_string(),
                entry_type: "file".to_string(),
                size: Some(4096),
            },
            RawEntry {
                name: "logs".to_string(),
                entry_type: "directory".to_string(),
                size: None,
            },
        ];
        let entries = annotate(raw, "http://10.0.0.7:591/r0/", "/r0/");

        assert_eq!(entries[0].entry_type, EntryType::File);
        assert_eq!(
            entries[0].url.as_deref(),
            Some("http://10.0.0.7:591/r0/stdout")
        );
        assert_eq!(entries[0].size, Some(4096));
        assert!(entries[0].path.is_none());

        assert_eq!(entries[1].entry_type, EntryType::Directory);
        assert_eq!(entries[1].path.as_deref(), Some("/r0/logs"));
        assert!(entries[1].url.is_none());
    }
}
