//! [`ObjectStore`] over the GitHub REST git-data api

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::path::PathKey;
use crate::remote::{
    validate_branch_name, BranchInfo, ChangeStatus, ChangedPath, CommitInfo, Credential,
    EntryMode, NewTreeEntry, ObjectStore, RemoteTreeEntry, RepoId, TreeListing,
};

/// public GitHub api root
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const BRANCH_PAGE_SIZE: usize = 100;

/// HTTP-backed store for one GitHub repository
#[derive(Clone)]
pub struct GitHubStore {
    client: Client,
    api: Url,
    repo: RepoId,
    credential: Credential,
}

impl GitHubStore {
    /// build a client; every request carries `timeout` as its upper bound
    pub fn new(
        api_url: &str,
        repo: RepoId,
        credential: Credential,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self> {
        let api = Url::parse(api_url).map_err(|e| Error::network(format!("bad api url {}: {}", api_url, e)))?;
        if api.cannot_be_a_base() {
            return Err(Error::network(format!("bad api url {}", api_url)));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(Error::network)?;

        Ok(Self {
            client,
            api,
            repo,
            credential,
        })
    }

    /// url under `/repos/{owner}/{name}/...`
    fn repo_url(&self, segments: &[&str]) -> Url {
        let mut url = self.api.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .push("repos")
                .push(&self.repo.owner)
                .push(&self.repo.name)
                .extend(segments);
        }
        url
    }

    /// `git/ref(s)/heads/<branch>` with the branch split on `/`
    fn head_url(&self, collection: &str, branch: &str) -> Url {
        let mut segments = vec!["git", collection, "heads"];
        segments.extend(branch.split('/'));
        self.repo_url(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTHORIZATION, format!("token {}", self.credential.secret()))
            .header(ACCEPT, "application/vnd.github+json")
    }

    /// send, mapping only transport failures
    async fn send_raw(&self, req: RequestBuilder, operation: &str) -> Result<Response> {
        debug!(operation, "github request");
        req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    operation: operation.to_string(),
                }
            } else {
                Error::network(format!("{}: {}", operation, e))
            }
        })
    }

    /// send and turn non-success statuses into errors
    async fn send(&self, req: RequestBuilder, operation: &str) -> Result<Response> {
        let resp = self.send_raw(req, operation).await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(status_error(resp, operation).await)
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, operation: &str) -> Result<T> {
        let resp = self.send(self.request(Method::GET, url), operation).await?;
        decode_json(resp, operation).await
    }

    async fn post_json<B, T>(&self, url: Url, body: &B, operation: &str) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let req = self.request(Method::POST, url).json(body);
        let resp = self.send(req, operation).await?;
        decode_json(resp, operation).await
    }
}

async fn decode_json<T: DeserializeOwned>(resp: Response, operation: &str) -> Result<T> {
    resp.json::<T>()
        .await
        .map_err(|e| Error::network(format!("{}: invalid response body: {}", operation, e)))
}

/// map an unsuccessful response onto the error taxonomy
async fn status_error(resp: Response, operation: &str) -> Error {
    let status = resp.status();
    let rate_limited = is_rate_limited(status, resp.headers());
    let retry_after = retry_after_secs(resp.headers());
    let body = resp
        .text()
        .await
        .unwrap_or_else(|e| format!("unreadable body: {}", e));

    if rate_limited {
        return Error::RateLimited { retry_after };
    }

    match status {
        StatusCode::NOT_FOUND => Error::PathNotFound(operation.to_string()),
        _ => Error::Network {
            message: format!("{} {} ({}): {}", status.as_u16(), status.canonical_reason().unwrap_or(""), operation, body.trim()),
        },
    }
}

fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status == StatusCode::FORBIDDEN
        && headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim() == "0")
            .unwrap_or(false)
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// decode a `content` field as served by the blobs and contents endpoints
fn decode_content(content: &str, encoding: &str) -> Result<Bytes> {
    match encoding {
        "base64" => {
            let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            BASE64
                .decode(compact.as_bytes())
                .map(Bytes::from)
                .map_err(|e| Error::network(format!("invalid base64 content: {}", e)))
        }
        "utf-8" | "" => Ok(Bytes::copy_from_slice(content.as_bytes())),
        other => Err(Error::network(format!("unsupported content encoding {}", other))),
    }
}

fn parse_id(sha: &str) -> Result<ObjectId> {
    ObjectId::from_hex(sha)
}

// response payloads, reduced to the fields we read

#[derive(Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Deserialize)]
struct BranchPayload {
    name: String,
    commit: ShaOnly,
}

#[derive(Deserialize)]
struct RefPayload {
    object: ShaOnly,
}

#[derive(Deserialize)]
struct CommitPayload {
    sha: String,
    tree: ShaOnly,
    #[serde(default)]
    parents: Vec<ShaOnly>,
}

#[derive(Deserialize)]
struct TreePayload {
    #[serde(default)]
    tree: Vec<TreeItemPayload>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeItemPayload {
    path: String,
    mode: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Deserialize)]
struct ContentPayload {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
    #[serde(default)]
    sha: Option<String>,
}

#[derive(Deserialize)]
struct ComparePayload {
    #[serde(default)]
    files: Vec<CompareFilePayload>,
}

#[derive(Deserialize)]
struct CompareFilePayload {
    filename: String,
    status: String,
}

#[derive(Serialize)]
struct CreateBlobBody {
    content: String,
    encoding: &'static str,
}

#[derive(Serialize)]
struct CreateTreeBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    base_tree: Option<String>,
    tree: Vec<CreateTreeItem<'a>>,
}

#[derive(Serialize)]
struct CreateTreeItem<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    /// `null` removes the path from the base tree
    sha: Option<String>,
}

#[derive(Serialize)]
struct CreateCommitBody<'a> {
    message: &'a str,
    tree: String,
    parents: Vec<String>,
}

#[derive(Serialize)]
struct CreateRefBody {
    #[serde(rename = "ref")]
    reference: String,
    sha: String,
}

#[derive(Serialize)]
struct UpdateRefBody {
    sha: String,
    force: bool,
}

#[async_trait]
impl ObjectStore for GitHubStore {
    fn repository(&self) -> &RepoId {
        &self.repo
    }

    async fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        let mut branches = Vec::new();
        let mut page = 1usize;

        loop {
            let mut url = self.repo_url(&["branches"]);
            url.query_pairs_mut()
                .append_pair("per_page", &BRANCH_PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());

            let batch: Vec<BranchPayload> = self.get_json(url, "list branches").await?;
            let done = batch.len() < BRANCH_PAGE_SIZE;
            for branch in batch {
                branches.push(BranchInfo {
                    name: branch.name,
                    tip: parse_id(&branch.commit.sha)?,
                });
            }
            if done {
                break;
            }
            page += 1;
        }

        Ok(branches)
    }

    async fn get_ref(&self, branch: &str) -> Result<Option<ObjectId>> {
        validate_branch_name(branch)?;
        let url = self.head_url("ref", branch);
        match self.get_json::<RefPayload>(url, "get ref").await {
            Ok(payload) => Ok(Some(parse_id(&payload.object.sha)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_commit(&self, commit: &ObjectId) -> Result<CommitInfo> {
        let url = self.repo_url(&["git", "commits", &commit.to_hex()]);
        let payload: CommitPayload = self.get_json(url, "get commit").await.map_err(|e| {
            if e.is_not_found() {
                Error::ObjectNotFound(*commit)
            } else {
                e
            }
        })?;

        Ok(CommitInfo {
            id: parse_id(&payload.sha)?,
            tree: parse_id(&payload.tree.sha)?,
            parents: payload
                .parents
                .iter()
                .map(|p| parse_id(&p.sha))
                .collect::<Result<_>>()?,
        })
    }

    async fn get_tree(&self, tree_or_ref: &str, recursive: bool) -> Result<TreeListing> {
        let mut url = self.repo_url(&["git", "trees", tree_or_ref]);
        if recursive {
            url.query_pairs_mut().append_pair("recursive", "1");
        }
        let payload: TreePayload = self.get_json(url, "get tree").await?;

        let mut entries = Vec::with_capacity(payload.tree.len());
        for item in payload.tree {
            entries.push(RemoteTreeEntry {
                path: item.path,
                address: parse_id(&item.sha)?,
                mode: EntryMode::parse(&item.mode)?,
                size: item.size,
            });
        }

        Ok(TreeListing {
            entries,
            truncated: payload.truncated,
        })
    }

    async fn get_blob(&self, address: &ObjectId) -> Result<Bytes> {
        let url = self.repo_url(&["git", "blobs", &address.to_hex()]);
        let payload: ContentPayload = self.get_json(url, "get blob").await.map_err(|e| {
            if e.is_not_found() {
                Error::ObjectNotFound(*address)
            } else {
                e
            }
        })?;
        decode_content(&payload.content, &payload.encoding)
    }

    async fn get_file_at(&self, path: &PathKey, reference: &str) -> Result<Bytes> {
        let mut segments = vec!["contents"];
        segments.extend(path.components());
        let mut url = self.repo_url(&segments);
        url.query_pairs_mut().append_pair("ref", reference);

        let payload: ContentPayload = self.get_json(url, "get file").await.map_err(|e| {
            if e.is_not_found() {
                Error::PathNotFound(format!("{}@{}", path, reference))
            } else {
                e
            }
        })?;

        // files above the contents api size limit come back without a body
        if payload.encoding == "none" {
            let sha = payload
                .sha
                .ok_or_else(|| Error::MissingContent(path.to_string()))?;
            return self.get_blob(&parse_id(&sha)?).await;
        }
        decode_content(&payload.content, &payload.encoding)
    }

    async fn create_blob(&self, content: Bytes) -> Result<ObjectId> {
        let url = self.repo_url(&["git", "blobs"]);
        let body = CreateBlobBody {
            content: BASE64.encode(&content),
            encoding: "base64",
        };
        let created: ShaOnly = self.post_json(url, &body, "create blob").await?;
        parse_id(&created.sha)
    }

    async fn create_tree(&self, base: Option<&ObjectId>, entries: &[NewTreeEntry]) -> Result<ObjectId> {
        let url = self.repo_url(&["git", "trees"]);
        let body = CreateTreeBody {
            base_tree: base.map(|b| b.to_hex()),
            tree: entries
                .iter()
                .map(|e| CreateTreeItem {
                    path: e.path.as_str(),
                    mode: e.mode.as_str(),
                    kind: "blob",
                    sha: e.address.map(|a| a.to_hex()),
                })
                .collect(),
        };
        let created: ShaOnly = self.post_json(url, &body, "create tree").await?;
        parse_id(&created.sha)
    }

    async fn create_commit(&self, message: &str, tree: &ObjectId, parents: &[ObjectId]) -> Result<ObjectId> {
        let url = self.repo_url(&["git", "commits"]);
        let body = CreateCommitBody {
            message,
            tree: tree.to_hex(),
            parents: parents.iter().map(|p| p.to_hex()).collect(),
        };
        let created: ShaOnly = self.post_json(url, &body, "create commit").await?;
        parse_id(&created.sha)
    }

    async fn create_ref(&self, branch: &str, commit: &ObjectId) -> Result<()> {
        validate_branch_name(branch)?;
        let url = self.repo_url(&["git", "refs"]);
        let body = CreateRefBody {
            reference: format!("refs/heads/{}", branch),
            sha: commit.to_hex(),
        };

        let req = self.request(Method::POST, url).json(&body);
        let resp = self.send_raw(req, "create ref").await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
                let message = resp.text().await.unwrap_or_default();
                Err(Error::Conflict {
                    branch: branch.to_string(),
                    expected: "no branch".to_string(),
                    message: message.trim().to_string(),
                })
            }
            _ => Err(status_error(resp, "create ref").await),
        }
    }

    async fn update_ref(&self, branch: &str, commit: &ObjectId, expected: &ObjectId) -> Result<()> {
        validate_branch_name(branch)?;
        // the api has no compare-and-swap; a branch reset to an ancestor of
        // `expected` would still accept our commit as a fast forward
        ensure_ref_at(branch, self.get_ref(branch).await?, expected)?;

        let url = self.head_url("refs", branch);
        let body = UpdateRefBody {
            sha: commit.to_hex(),
            force: false,
        };

        // with force=false the api refuses anything that is not a fast
        // forward, which covers a branch that moves between the read above
        // and this write
        let req = self.request(Method::PATCH, url).json(&body);
        let resp = self.send_raw(req, "update ref").await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
                let message = resp.text().await.unwrap_or_default();
                Err(Error::Conflict {
                    branch: branch.to_string(),
                    expected: expected.to_hex(),
                    message: message.trim().to_string(),
                })
            }
            _ => Err(status_error(resp, "update ref").await),
        }
    }

    async fn compare_refs(&self, base: &str, head: &str) -> Result<Vec<ChangedPath>> {
        let range = format!("{}...{}", base, head);
        let mut url = self.repo_url(&["compare", &range]);
        url.query_pairs_mut().append_pair("per_page", "300");

        let payload: ComparePayload = self.get_json(url, "compare refs").await?;
        Ok(payload
            .files
            .into_iter()
            .map(|f| ChangedPath {
                path: f.filename,
                status: ChangeStatus::parse(&f.status),
            })
            .collect())
    }
}

/// the branch tip read back before an update is still the expected one
fn ensure_ref_at(branch: &str, current: Option<ObjectId>, expected: &ObjectId) -> Result<()> {
    match current {
        Some(tip) if tip == *expected => Ok(()),
        Some(tip) => Err(Error::Conflict {
            branch: branch.to_string(),
            expected: expected.to_hex(),
            message: format!("branch is at {}", tip.short()),
        }),
        None => Err(Error::Conflict {
            branch: branch.to_string(),
            expected: expected.to_hex(),
            message: "branch was deleted".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GitHubStore {
        GitHubStore::new(
            DEFAULT_API_URL,
            RepoId::new("acme", "configs"),
            Credential::new("t"),
            Duration::from_secs(5),
            "treesync-test",
        )
        .unwrap()
    }

    #[test]
    fn test_ensure_ref_at() {
        let expected = crate::hash::compute_object_hash("commit", b"base");
        let older = crate::hash::compute_object_hash("commit", b"older");

        assert!(ensure_ref_at("main", Some(expected), &expected).is_ok());
        // reset to an ancestor would pass the fast-forward check on its own
        assert!(ensure_ref_at("main", Some(older), &expected)
            .unwrap_err()
            .is_conflict());
        assert!(ensure_ref_at("main", None, &expected).unwrap_err().is_conflict());
    }

    #[test]
    fn test_repo_url() {
        let url = store().repo_url(&["git", "trees", "main"]);
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/acme/configs/git/trees/main"
        );
    }

    #[test]
    fn test_enterprise_base_path_is_kept() {
        let store = GitHubStore::new(
            "https://ghe.example.com/api/v3/",
            RepoId::new("acme", "configs"),
            Credential::new("t"),
            Duration::from_secs(5),
            "treesync-test",
        )
        .unwrap();
        let url = store.repo_url(&["branches"]);
        assert_eq!(
            url.as_str(),
            "https://ghe.example.com/api/v3/repos/acme/configs/branches"
        );
    }

    #[test]
    fn test_head_url_splits_hierarchical_branch() {
        let url = store().head_url("refs", "feature/xml");
        assert!(url.as_str().ends_with("/git/refs/heads/feature/xml"));
    }

    #[test]
    fn test_bad_api_url() {
        assert!(GitHubStore::new(
            "not a url",
            RepoId::new("a", "b"),
            Credential::new("t"),
            Duration::from_secs(1),
            "ua",
        )
        .is_err());
    }

    #[test]
    fn test_decode_content_base64_with_newlines() {
        let bytes = decode_content("PGEv\nPgo=\n", "base64").unwrap();
        assert_eq!(&bytes[..], b"<a/>\n");
    }

    #[test]
    fn test_decode_content_keeps_raw_bytes() {
        // CRLF and BOM must survive transport untouched
        let raw = b"\xef\xbb\xbf<a/>\r\n";
        let encoded = BASE64.encode(raw);
        assert_eq!(&decode_content(&encoded, "base64").unwrap()[..], raw);
    }

    #[test]
    fn test_decode_content_unknown_encoding() {
        assert!(decode_content("x", "rot13").is_err());
    }

    #[test]
    fn test_rate_limit_detection() {
        let mut headers = HeaderMap::new();
        assert!(is_rate_limited(StatusCode::TOO_MANY_REQUESTS, &headers));
        assert!(!is_rate_limited(StatusCode::FORBIDDEN, &headers));

        headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
        headers.insert(RETRY_AFTER, "42".parse().unwrap());
        assert!(is_rate_limited(StatusCode::FORBIDDEN, &headers));
        assert_eq!(retry_after_secs(&headers), Some(42));
    }

    #[test]
    fn test_tree_body_serializes_tombstone_as_null() {
        let entries = [NewTreeEntry {
            path: PathKey::new("a.xml").unwrap(),
            mode: EntryMode::Blob,
            address: None,
        }];
        let body = CreateTreeBody {
            base_tree: Some("b".repeat(40)),
            tree: entries
                .iter()
                .map(|e| CreateTreeItem {
                    path: e.path.as_str(),
                    mode: e.mode.as_str(),
                    kind: "blob",
                    sha: e.address.map(|a| a.to_hex()),
                })
                .collect(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["tree"][0]["sha"].is_null());
        assert_eq!(json["tree"][0]["mode"], "100644");
        assert_eq!(json["tree"][0]["type"], "blob");
    }
}
