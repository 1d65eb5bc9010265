/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Functions to redact strings to remove PII before logging them

/// Redact a URL, replacing all characters other than [`:`, `/`] with `x`
pub fn redact_url(url: &str) -> String {
    url.replace(|ch| ch != ':' && ch != '/', "x")
}

/// Redact compact jwe string (Five base64 segments, separated by `.` chars)
pub fn redact_compact_jwe(url: &str) -> String {
    url.replace(|ch| ch != '.', "x")
}

/// Redact a bearer/API token value before it's written to a log line, e.g. the
/// `Authorization: Bearer <token>` header value sent to either remote.
pub fn redact_secret(value: &str) -> String {
    let len = value.chars().count();
    if len <= 8 {
        return "***".to_string();
    }
    let head: String = value.chars().take(4).collect();
    let tail: String = value.chars().skip(len - 4).collect();
    format!("{head}…{tail} ({len} chars)")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("http://some.website.com/index.html"),
            "xxxx://xxxxxxxxxxxxxxxx/xxxxxxxxxx"
        );
        assert_eq!(
            redact_url("http://some.website.com:8000/foo/bar/baz"),
            "xxxx://xxxxxxxxxxxxxxxx:xxxx/xxx/xxx/xxx"
        );
    }

    #[test]
    fn test_redact_compact_jwe() {
        assert_eq!(redact_compact_jwe("abc.1234.x3243"), "xxx.xxxx.xxxxx")
    }

    #[test]
    fn test_redact_secret() {
        assert_eq!(redact_secret("short"), "***");
        assert_eq!(redact_secret("abcd1234efgh5678"), "abcd…5678 (16 chars)");
    }
}
