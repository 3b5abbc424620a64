use anyhow::{Context, Result};
use std::env;
use std::io::{self, Read, Write};

use crate::incoming::form::{RequestContext, parse_request};
use crate::incoming::intake;
use crate::incoming::notify;
use crate::incoming::page::{Page, RETRY_LATER};

const CONTENT_TYPE_HEADER: &str = "Content-Type: text/html; charset=utf-8";

fn read_body(input: &mut impl Read) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    match env::var("CONTENT_LENGTH").ok().and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(len) => {
            input
                .take(len)
                .read_to_end(&mut body)
                .context("failed to read request body")?;
        }
        None if env::var("REQUEST_METHOD").is_ok_and(|m| m.eq_ignore_ascii_case("POST")) => {
            input
                .read_to_end(&mut body)
                .context("failed to read request body")?;
        }
        None => {}
    }
    Ok(body)
}

fn respond(html: &str) -> Result<()> {
    let mut out = io::stdout().lock();
    write!(out, "{CONTENT_TYPE_HEADER}\r\n\r\n{html}")?;
    out.flush()?;
    Ok(())
}

/// Serve one request from the CGI environment. The submitter always gets a
/// page; internal failures are logged and answered with a retry-later page.
pub fn run() -> Result<()> {
    let cfg = match crate::commands::load_runtime() {
        Ok(cfg) => cfg,
        Err(err) => {
            crate::logging::init(None);
            tracing::error!(error = %format!("{err:#}"), "archive config unusable");
            return respond(&Page::error(RETRY_LATER).render(None));
        }
    };
    let template_dir = cfg.paths.template_dir.as_deref();
    let ctx = RequestContext::from_cgi_env();

    let body = read_body(&mut io::stdin().lock())?;
    let content_type = env::var("CONTENT_TYPE").ok();
    let form = match parse_request(content_type.as_deref(), body) {
        Ok(form) => form,
        Err(err) => {
            tracing::error!(
                error = %format!("{err:#}"),
                remote_addr = %ctx.remote_addr,
                user_agent = %ctx.user_agent,
                "unreadable upload request"
            );
            return respond(&Page::error(RETRY_LATER).render(template_dir));
        }
    };

    let notifier = notify::from_config(&cfg.notify);
    let page = intake::handle(&cfg, &ctx, &form, notifier.as_ref());
    respond(&page.render(template_dir))
}
