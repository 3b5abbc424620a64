use crate::incoming::util::html_escape;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const FALLBACK_FOOTER: &str = "<p><a href=\"https://ifarchive.org/\">The IF Archive</a></p>";

const FALLBACK_MAIN: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Upload to the IF Archive</title></head>
<body>
<h1>Upload to the IF Archive</h1>
<form action=\"{posturl}\" method=\"post\" enctype=\"multipart/form-data\">
<p>File: <input type=\"file\" name=\"file.1\"></p>
<p>Your name: <input type=\"text\" name=\"name\"></p>
<p>Your email: <input type=\"text\" name=\"email\"></p>
<p>Suggested directory: <input type=\"text\" name=\"directory\"></p>
<p>Description:<br><textarea name=\"filedesc\"></textarea></p>
<p>Right to use: <input type=\"text\" name=\"rights\"></p>
<p><label><input type=\"checkbox\" name=\"tos\"> I agree to the Terms of Use</label></p>
<input type=\"hidden\" name=\"ifdbid\" value=\"\">
<p><input {button}></p>
</form>
{footer}
</body></html>";

const FALLBACK_ERROR: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Upload error</title></head>
<body>
<h1>Upload error</h1>
{errorparas}
{footer}
</body></html>";

const FALLBACK_ACCEPTED: &str = "<!DOCTYPE html>
<html><head><meta charset=\"utf-8\"><title>Upload accepted</title></head>
<body>
<h1>Upload accepted</h1>
<p>Thank you. The following files were received:</p>
{filenames}
{footer}
</body></html>";

pub const RETRY_LATER: &str = "We were unable to process your uploaded file at this time. \
We apologize for the inconvenience, and ask that you try again later. If the problem \
persists, please contact the archive maintainers.";

/// One line of the accepted page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedEntry {
    pub display_name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Form {
        post_url: String,
        uploads_enabled: bool,
    },
    /// Plain-text paragraphs; escaped on render.
    Error { paragraphs: Vec<String> },
    Accepted {
        files: Vec<AcceptedEntry>,
        failed: Vec<String>,
    },
}

impl Page {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            paragraphs: vec![message.into()],
        }
    }

    pub fn render(&self, template_dir: Option<&Path>) -> String {
        let footer = load_template(template_dir, "footer.html", FALLBACK_FOOTER);
        let mut map = BTreeMap::new();
        map.insert("footer", footer);

        let name = match self {
            Self::Form {
                post_url,
                uploads_enabled,
            } => {
                let button = if *uploads_enabled {
                    "type=\"submit\" value=\"Upload File\""
                } else {
                    "type=\"button\" value=\"Upload Disabled (upload directory is full)\""
                };
                map.insert("posturl", html_escape(post_url));
                map.insert("button", button.to_string());
                "main.html"
            }
            Self::Error { paragraphs } => {
                map.insert("errorparas", paragraphs_html(paragraphs));
                "error.html"
            }
            Self::Accepted { files, failed } => {
                let mut html = vec!["<ul>".to_string()];
                for file in files {
                    html.push(format!(
                        "<li>{} ({} bytes)</li>",
                        html_escape(&file.display_name),
                        file.size_bytes
                    ));
                }
                html.push("</ul>".to_string());
                if !failed.is_empty() {
                    let names = failed
                        .iter()
                        .map(|n| html_escape(n))
                        .collect::<Vec<_>>()
                        .join(", ");
                    html.push(format!("<p>Not received: {names}. {}</p>", html_escape(RETRY_LATER)));
                }
                map.insert("filenames", html.join("\n"));
                "accepted.html"
            }
        };

        let fallback = match name {
            "main.html" => FALLBACK_MAIN,
            "error.html" => FALLBACK_ERROR,
            _ => FALLBACK_ACCEPTED,
        };
        substitute(&load_template(template_dir, name, fallback), &map)
    }
}

fn paragraphs_html(paragraphs: &[String]) -> String {
    paragraphs
        .iter()
        .map(|p| format!("<p>{}</p>", html_escape(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn load_template(template_dir: Option<&Path>, name: &str, fallback: &str) -> String {
    let Some(dir) = template_dir else {
        return fallback.to_string();
    };
    match fs::read_to_string(dir.join(name)) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!(template = name, error = %err, "using built-in template");
            fallback.to_string()
        }
    }
}

/// Replace each `{key}` with its value; no escaping, no nesting.
fn substitute(text: &str, map: &BTreeMap<&str, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in map {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
