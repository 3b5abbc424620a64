use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::env;

/// Where a request came from, for logs, ledger rows and operator notices.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub remote_addr: String,
    pub user_agent: String,
    pub post_url: String,
    pub request_uri: Option<String>,
    pub referer: Option<String>,
}

fn env_or(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

impl RequestContext {
    pub fn from_cgi_env() -> Self {
        Self {
            remote_addr: env_or("REMOTE_ADDR", "?"),
            user_agent: env_or("HTTP_USER_AGENT", "No Known Browser"),
            post_url: env_or("SCRIPT_NAME", ""),
            request_uri: env::var("REQUEST_URI").ok(),
            referer: env::var("HTTP_REFERER").ok(),
        }
    }

    /// `KEY: value` lines for the tail of an operator notice.
    pub fn env_block(&self) -> Vec<String> {
        let mut out = vec![
            format!("REMOTE_ADDR: {}", self.remote_addr),
            format!("HTTP_USER_AGENT: {}", self.user_agent),
        ];
        if let Some(uri) = &self.request_uri {
            out.push(format!("REQUEST_URI: {uri}"));
        }
        if let Some(referer) = &self.referer {
            out.push(format!("HTTP_REFERER: {referer}"));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct FilePart {
    pub filename: Option<String>,
    pub content: Bytes,
}

/// Decoded form submission: text fields plus `file.N` parts.
#[derive(Debug, Clone, Default)]
pub struct UploadForm {
    fields: BTreeMap<String, Vec<String>>,
    files: BTreeMap<String, FilePart>,
}

impl UploadForm {
    #[cfg(test)]
    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    #[cfg(test)]
    pub fn with_file(mut self, index: usize, filename: &str, content: impl Into<Bytes>) -> Self {
        self.files.insert(
            format!("file.{index}"),
            FilePart {
                filename: Some(filename.to_string()),
                content: content.into(),
            },
        );
        self
    }

    /// First value of `name`, treating an empty value as absent.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn has_files(&self) -> bool {
        self.files.contains_key("file.1")
    }

    /// `file.1`, `file.2`, … up to the first missing index.
    pub fn file_parts(&self) -> impl Iterator<Item = &FilePart> {
        (1..).map_while(|n| self.files.get(&format!("file.{n}")))
    }
}

/// Browsers send `"` in multipart filenames as `%22`.
pub fn restore_quoted_filename(raw: &str) -> String {
    raw.replace("%22", "\"")
}

pub fn parse_multipart(content_type: &str, body: Vec<u8>) -> Result<UploadForm> {
    let boundary = multer::parse_boundary(content_type)
        .with_context(|| format!("invalid multipart content type: {content_type}"))?;
    let stream =
        futures::stream::once(async move { Ok::<Bytes, std::io::Error>(Bytes::from(body)) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    futures::executor::block_on(async move {
        let mut form = UploadForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .context("malformed multipart body")?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            let filename = field.file_name().map(restore_quoted_filename);
            let content = field
                .bytes()
                .await
                .with_context(|| format!("failed to read form field {name}"))?;

            if name.starts_with("file.") {
                form.files.insert(name, FilePart { filename, content });
            } else {
                let value = String::from_utf8_lossy(&content).into_owned();
                form.fields.entry(name).or_default().push(value);
            }
        }
        Ok::<UploadForm, anyhow::Error>(form)
    })
}

/// Decode a CGI body; anything that is not multipart yields an empty form.
pub fn parse_request(content_type: Option<&str>, body: Vec<u8>) -> Result<UploadForm> {
    match content_type {
        Some(ct) if ct.to_ascii_lowercase().starts_with("multipart/form-data") => {
            parse_multipart(ct, body)
        }
        _ => Ok(UploadForm::default()),
    }
}
