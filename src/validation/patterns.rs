//! Output scanning: fake-success signatures, claimed paths and evidence.

use std::sync::OnceLock;

use regex::Regex;

/// A denylisted signature and the violation name it reports.
struct Signature {
    name: &'static str,
    pattern: &'static str,
}

const SIGNATURES: &[Signature] = &[
    Signature {
        name: "TODO",
        pattern: r"\bTODO\b",
    },
    Signature {
        name: "FIXME",
        pattern: r"\bFIXME\b",
    },
    Signature {
        name: "placeholder",
        pattern: r"(?i)\bplace[\s-]?holders?\b",
    },
    Signature {
        name: "simulated",
        pattern: r"(?i)\bsimulat(?:ed|es|ing|ion)\b",
    },
    Signature {
        name: "should work",
        pattern: r"(?i)\bshould\s+(?:now\s+)?work\b",
    },
    Signature {
        name: "assumes",
        pattern: r"(?i)\bassum(?:es|ed|ing)\b",
    },
    Signature {
        name: "sleep()",
        pattern: r"\b(?:time\.)?sleep\s*\(",
    },
    Signature {
        name: "hardcoded success",
        pattern: r#"(?i)"?\b(?:success|succeeded|passed|ok)\b"?\s*(?:=|:|==)\s*true\b"#,
    },
    Signature {
        name: "not implemented",
        pattern: r"(?i)\bnot\s+(?:yet\s+)?implemented\b|\bunimplemented!\s*\(|\btodo!\s*\(",
    },
];

fn signatures() -> &'static [(&'static str, Regex)] {
    static RE: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RE.get_or_init(|| {
        SIGNATURES
            .iter()
            .map(|s| (s.name, Regex::new(s.pattern).expect("valid signature regex")))
            .collect()
    })
}

/// Names of every denylisted signature found in `output`.
pub fn find_signatures(output: &str) -> Vec<&'static str> {
    signatures()
        .iter()
        .filter(|(_, re)| re.is_match(output))
        .map(|(name, _)| *name)
        .collect()
}

/// Regexes whose matches count as concrete evidence.
fn evidence_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            // "12 tests", "3 failed", "0 warnings"
            r"(?i)\b\d+\s+(?:tests?|passed|failed|failures?|errors?|warnings?|files?|lines?|assertions?|checks?|cases?)\b",
            // "line 42", "lines 10-12"
            r"(?i)\blines?\s+\d+",
            // "exit code 0", "exit status: 1"
            r"(?i)\bexit(?:ed)?\s+(?:with\s+)?(?:code|status)\s*:?\s*\d+",
            // shell transcript line
            r"(?m)^\s*\$ \S",
            // fenced block
            r"(?s)```.*?```",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid evidence regex"))
        .collect()
    })
}

/// Number of evidence items `output` carries by text alone.
pub fn count_text_evidence(output: &str) -> usize {
    evidence_patterns()
        .iter()
        .map(|re| re.find_iter(output).count())
        .sum()
}

fn path_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w./-]+$").expect("valid path regex"))
}

fn line_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?):(\d+)(?::\d+)?$").expect("valid line suffix regex"))
}

/// Extensions that mark a bare token as a file claim.
const FILE_EXTENSIONS: &[&str] = &[
    "rs", "toml", "lock", "py", "js", "ts", "tsx", "jsx", "go", "c", "h", "cc", "cpp", "hpp",
    "java", "kt", "rb", "sh", "md", "txt", "json", "yaml", "yml", "xml", "html", "css", "csv",
    "sql", "log", "ini", "cfg", "conf", "env", "proto",
];

/// Words after which a bare file name is asserted, not just mentioned.
const WRITE_VERBS: &[&str] = &[
    "wrote", "write", "written", "created", "create", "edited", "edit", "modified", "modify",
    "updated", "update", "changed", "change", "fixed", "added", "saved", "generated", "patched",
    "touched",
];

/// Filler words allowed between a write verb and the file name.
const VERB_FILLERS: &[&str] = &["the", "a", "an", "to", "file", "new"];

/// Extensions that double as product names when the stem is capitalised (`Node.js`).
const NAME_EXTENSIONS: &[&str] = &["js", "rs"];

/// How strongly an output commits to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimKind {
    /// Passing mention: evidence when it exists, ignored otherwise
    Mention,
    /// Asserted file: missing is a violation
    Firm,
}

/// A file path mentioned in worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathClaim {
    pub path: String,
    /// Claim carried a `:line` reference
    pub line: Option<u32>,
    pub kind: ClaimKind,
}

/// Extract file path claims from `output`, in order of first mention.
///
/// Firm claims are paths with a directory and a known extension, and bare
/// file names anchored by `:line` or a preceding write verb ("wrote notes.md").
/// Rooted paths without an extension (`/api/users`) and bare file names in
/// prose (`docs.rs`) are mentions. Capitalised `Name.js` / `Name.rs` tokens and
/// URLs are ignored.
pub fn extract_paths(output: &str) -> Vec<PathClaim> {
    let mut claims: Vec<PathClaim> = Vec::new();
    let mut after_verb = false;

    for raw in output.split_whitespace() {
        if raw.contains("://") {
            after_verb = false;
            continue;
        }
        let token = raw
            .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '(' | ')' | '[' | ']' | '{' | '}' | '<' | '>' | ','))
            .trim_end_matches(['.', ':', ';', '!', '?']);

        let (path, line) = match line_suffix().captures(token) {
            Some(caps) => (
                caps.get(1).map_or("", |m| m.as_str()),
                caps.get(2).and_then(|m| m.as_str().parse().ok()),
            ),
            None => (token, None),
        };

        let kind = classify(path, line.is_some(), after_verb);

        let word = token.to_ascii_lowercase();
        after_verb = WRITE_VERBS.contains(&word.as_str())
            || (after_verb && VERB_FILLERS.contains(&word.as_str()));

        let Some(kind) = kind else {
            continue;
        };
        if let Some(existing) = claims.iter_mut().find(|c| c.path == path) {
            existing.line = existing.line.or(line);
            existing.kind = existing.kind.max(kind);
            continue;
        }
        claims.push(PathClaim {
            path: path.to_string(),
            line,
            kind,
        });
    }

    claims
}

fn classify(token: &str, has_line: bool, after_verb: bool) -> Option<ClaimKind> {
    if token.len() < 2 || !path_token().is_match(token) {
        return None;
    }
    let rooted = token.starts_with('/') || token.starts_with("./") || token.starts_with("../");
    if rooted && !token.trim_start_matches(['.', '/']).chars().any(char::is_alphanumeric) {
        return None;
    }

    let has_dir = token.contains('/');
    let last = token.rsplit('/').next().unwrap_or(token);
    let extension = last
        .rsplit_once('.')
        .filter(|(stem, ext)| {
            !stem.is_empty() && FILE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        });

    match (has_dir, extension) {
        (true, Some(_)) => Some(ClaimKind::Firm),
        (true, None) if rooted && has_line => Some(ClaimKind::Firm),
        (true, None) if rooted => Some(ClaimKind::Mention),
        (true, None) => None,
        (false, None) => None,
        (false, Some((stem, ext))) => {
            let product_name = stem.starts_with(|c: char| c.is_ascii_uppercase())
                && NAME_EXTENSIONS.contains(&ext);
            if product_name {
                None
            } else if has_line || after_verb {
                Some(ClaimKind::Firm)
            } else {
                Some(ClaimKind::Mention)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_todo() {
        assert_eq!(find_signatures("TODO: implement this"), vec!["TODO"]);
    }

    #[test]
    fn test_signature_variants() {
        let found = find_signatures(
            "This is a placeholder; results are simulated and it should work. \
             It assumes a db. time.sleep(1); success = true",
        );
        for name in ["placeholder", "simulated", "should work", "assumes", "sleep()", "hardcoded success"] {
            assert!(found.contains(&name), "missing {} in {:?}", name, found);
        }
        assert!(find_signatures(r#"{"success": true}"#).contains(&"hardcoded success"));
        assert!(find_signatures("fn f() { todo!() }").contains(&"not implemented"));
    }

    #[test]
    fn test_clean_output_has_no_signatures() {
        assert!(find_signatures("Ran 12 tests, all passed, see output above").is_empty());
        // lowercase "todo" in prose is not the marker
        assert!(find_signatures("updated the todo list app").is_empty());
    }

    #[test]
    fn test_text_evidence() {
        assert_eq!(count_text_evidence("Ran 12 tests, all passed, see output above"), 1);
        assert_eq!(count_text_evidence("looks fine to me"), 0);
        let transcript = "$ cargo test\n```\ntest result: ok. 4 passed; 0 failed\n```\nexit code 0";
        assert!(count_text_evidence(transcript) >= 4);
    }

    #[test]
    fn test_extract_paths() {
        let claims = extract_paths(
            "Wrote `src/lib.rs` and /tmp/out/report.md. Fixed src/lib.rs:42, see https://example.com/a.md",
        );
        assert_eq!(
            claims,
            vec![
                PathClaim {
                    path: "src/lib.rs".to_string(),
                    line: Some(42),
                    kind: ClaimKind::Firm,
                },
                PathClaim {
                    path: "/tmp/out/report.md".to_string(),
                    line: None,
                    kind: ClaimKind::Firm,
                },
            ]
        );
    }

    #[test]
    fn test_bare_names_need_an_anchor() {
        let kinds = |output: &str| -> Vec<(String, ClaimKind)> {
            extract_paths(output)
                .into_iter()
                .map(|c| (c.path, c.kind))
                .collect()
        };
        assert_eq!(
            kinds("API docs are on docs.rs"),
            vec![("docs.rs".to_string(), ClaimKind::Mention)]
        );
        assert_eq!(
            kinds("Updated the README.md and main.rs:7"),
            vec![
                ("README.md".to_string(), ClaimKind::Firm),
                ("main.rs".to_string(), ClaimKind::Firm),
            ]
        );
    }

    #[test]
    fn test_product_names_are_not_paths() {
        assert!(extract_paths("Ran 12 tests, all passed on Node.js").is_empty());
        assert!(extract_paths("ported the widget to Vue.js and Next.js").is_empty());
        // a directory makes it a path again
        assert_eq!(extract_paths("edited web/Node.js")[0].kind, ClaimKind::Firm);
    }

    #[test]
    fn test_rooted_routes_are_mentions() {
        let claims = extract_paths("Added the GET /api/users endpoint. Ran 4 tests, 4 passed");
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].path, "/api/users");
        assert_eq!(claims[0].kind, ClaimKind::Mention);
    }

    #[test]
    fn test_non_paths_ignored() {
        assert!(extract_paths("and/or e.g. v1.2.3 12/15 / example.com").is_empty());
        assert!(extract_paths("Ran 12 tests, all passed, see output above").is_empty());
    }
}
