//! Maintainer mail: renders failure/staging notifications from minijinja
//! templates, strips ANSI escapes, and size-caps the body before sending.
use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use minijinja::Environment;
use regex::Regex;

use crate::config::SmtpConfig;
use crate::Maintainer;

fn ansi_escape_regex() -> Regex {
    Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap()
}

pub fn strip_ansi(input: &str) -> String {
    ansi_escape_regex().replace_all(input, "").into_owned()
}

/// Truncates `body` to `max_bytes`, keeping a head and tail slice around a
/// notice when it would otherwise be larger.
pub fn truncate_head_and_tail(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let notice = "\n\n... [truncated] ...\n\n";
    let keep = max_bytes.saturating_sub(notice.len()) / 2;
    let head = floor_char_boundary(body, keep);
    let tail_start = floor_char_boundary(body, body.len().saturating_sub(keep));
    format!("{}{}{}", &body[..head], notice, &body[tail_start..])
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

pub struct Report {
    pub subject: String,
    pub body: String,
}

const DOWNGRADE_TEMPLATE: &str = "{{ pkgname }} is older than packaged version ({{ built_version }} < {{ repo_version }})";
const OFFICIAL_CONFLICT_TEMPLATE: &str = "{{ pkgname }} would replace an official package or shadow an official group";
const BUILD_FAILED_TEMPLATE: &str = "{{ pkgbase }} failed to build";
const STAGING_REVIEW_TEMPLATE: &str = "{{ pkgbase }} staged for manual review";

fn render(template: &str, ctx: &minijinja::Value) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("t", template)?;
    let tmpl = env.get_template("t")?;
    Ok(tmpl.render(ctx)?)
}

pub fn downgrade_report(pkgname: &str, built_version: &str, repo_version: &str) -> Result<Report> {
    let ctx = minijinja::context! { pkgname, built_version, repo_version };
    Ok(Report {
        subject: render(DOWNGRADE_TEMPLATE, &ctx)?,
        body: render(DOWNGRADE_TEMPLATE, &ctx)?,
    })
}

pub fn official_conflict_report(pkgname: &str) -> Result<Report> {
    let ctx = minijinja::context! { pkgname };
    Ok(Report {
        subject: render(OFFICIAL_CONFLICT_TEMPLATE, &ctx)?,
        body: render(OFFICIAL_CONFLICT_TEMPLATE, &ctx)?,
    })
}

pub fn build_failed_report(pkgbase: &str, log_url: Option<&str>, log_tail: &str) -> Result<Report> {
    let ctx = minijinja::context! { pkgbase, log_url };
    let subject = render(BUILD_FAILED_TEMPLATE, &ctx)?;
    let mut body = subject.clone();
    if let Some(log_url) = log_url {
        body.push_str(&format!("\n\nlog: {log_url}\n\n"));
    }
    body.push_str(&strip_ansi(log_tail));
    Ok(Report { subject, body })
}

pub fn staging_review_report(pkgbase: &str) -> Result<Report> {
    let ctx = minijinja::context! { pkgbase };
    Ok(Report {
        subject: render(STAGING_REVIEW_TEMPLATE, &ctx)?,
        body: render(STAGING_REVIEW_TEMPLATE, &ctx)?,
    })
}

/// Sends `report` to every maintainer with a usable email address, after
/// stripping ANSI and capping the body to `max_bytes`.
pub fn send(smtp: &SmtpConfig, maintainers: &[Maintainer], report: &Report, max_bytes: usize) -> Result<()> {
    let body = truncate_head_and_tail(&strip_ansi(&report.body), max_bytes);
    let recipients: Vec<&str> = maintainers.iter().filter_map(|m| m.email.as_deref()).collect();
    if recipients.is_empty() {
        tracing::warn!("no maintainer has an email address; dropping report {:?}", report.subject);
        return Ok(());
    }

    let mut builder = Message::builder()
        .from(smtp.from_address.parse().context("invalid from address")?)
        .subject(report.subject.clone());
    for recipient in recipients {
        builder = builder.to(recipient.parse().context("invalid maintainer address")?);
    }
    let message = builder
        .header(ContentType::TEXT_PLAIN)
        .body(body)
        .context("failed to build mail message")?;

    let mut transport = SmtpTransport::relay(&smtp.host).context("failed to configure smtp transport")?;
    if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
        transport = transport.credentials(Credentials::new(username.clone(), password.clone()));
    }
    let transport = transport.port(smtp.port).build();
    transport.send(&message).context("failed to send mail")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_escape_sequences() {
        let input = "\x1b[31merror\x1b[0m: boom";
        assert_eq!(strip_ansi(input), "error: boom");
    }

    #[test]
    fn truncation_is_a_noop_under_limit() {
        let body = "short";
        assert_eq!(truncate_head_and_tail(body, 1024), body);
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let body = "a".repeat(100) + &"b".repeat(100);
        let truncated = truncate_head_and_tail(&body, 60);
        assert!(truncated.starts_with('a'));
        assert!(truncated.ends_with('b'));
        assert!(truncated.len() < body.len());
    }

    #[test]
    fn downgrade_report_renders_pkgname_and_versions() {
        let report = downgrade_report("foo", "1.0-1", "1.1-1").unwrap();
        assert!(report.subject.contains("foo"));
        assert!(report.subject.contains("1.0-1"));
        assert!(report.subject.contains("1.1-1"));
    }
}
