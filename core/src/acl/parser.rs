//! Access-control file parsing.
//!
//! Line-based: `ALLOW`, `REQUEST`, `ACCEPT`, and `EXEC` entries with
//! whitespace-separated fields, `#` comments to end of line, blank lines
//! ignored. A bad line is rejected with its line number; nothing of the
//! file takes effect (the previous table stays in force on reload).

use std::fs;
use std::path::Path;

use thiserror::Error;

use super::{
    AcceptEntry, AccessTable, AllowEntry, ExecEntry, HostPattern, RequestEntry, TransferMode,
};
use crate::class::Pattern;
use crate::feedtype::{parse_feedtype, FeedtypeTable};
use crate::util::tokenize_quoted;

/// Default peer port when a REQUEST names none.
pub const DEFAULT_PORT: u16 = 388;

#[derive(Error, Debug)]
pub enum AccessFileError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    BadEntry { line: usize, reason: String },
}

fn bad(line: usize, reason: impl Into<String>) -> AccessFileError {
    AccessFileError::BadEntry {
        line,
        reason: reason.into(),
    }
}

pub fn parse_access_file(
    path: &Path,
    feedtypes: &FeedtypeTable,
) -> Result<AccessTable, AccessFileError> {
    let text = fs::read_to_string(path).map_err(|source| AccessFileError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    parse_access_str(&text, feedtypes)
}

pub fn parse_access_str(
    text: &str,
    feedtypes: &FeedtypeTable,
) -> Result<AccessTable, AccessFileError> {
    let mut table = AccessTable::default();
    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = match raw.find('#') {
            Some(at) => &raw[..at],
            None => raw,
        };
        let tokens = tokenize_quoted(line);
        if tokens.is_empty() {
            continue;
        }
        let keyword = tokens[0].to_ascii_uppercase();
        let args = &tokens[1..];
        match keyword.as_str() {
            "ALLOW" => table.allow.push(parse_allow(lineno, args, feedtypes)?),
            "REQUEST" => table.request.push(parse_request(lineno, args, feedtypes)?),
            "ACCEPT" => table.accept.push(parse_accept(lineno, args, feedtypes)?),
            "EXEC" => {
                if args.is_empty() {
                    return Err(bad(lineno, "EXEC needs a command"));
                }
                // A single quoted argument is a whole command line.
                let argv = if args.len() == 1 {
                    tokenize_quoted(&args[0])
                } else {
                    args.to_vec()
                };
                table.exec.push(ExecEntry { argv });
            }
            other => return Err(bad(lineno, format!("unknown entry kind {:?}", other))),
        }
    }
    log::info!(
        "access table: {} allow, {} request, {} accept, {} exec",
        table.allow.len(),
        table.request.len(),
        table.accept.len(),
        table.exec.len()
    );
    Ok(table)
}

fn compile(lineno: usize, pattern: &str) -> Result<Pattern, AccessFileError> {
    Pattern::compile(pattern).map_err(|err| bad(lineno, err.to_string()))
}

fn parse_allow(
    lineno: usize,
    args: &[String],
    feedtypes: &FeedtypeTable,
) -> Result<AllowEntry, AccessFileError> {
    if args.len() < 2 || args.len() > 4 {
        return Err(bad(lineno, "ALLOW needs feedtype, host, [ok [not]]"));
    }
    let feedtype =
        parse_feedtype(feedtypes, &args[0]).map_err(|err| bad(lineno, err.to_string()))?;
    let hosts = HostPattern::classify(&args[1]).map_err(|err| bad(lineno, err.to_string()))?;
    let ok = match args.get(2) {
        Some(pattern) => compile(lineno, pattern)?,
        None => compile(lineno, ".*")?,
    };
    let not = match args.get(3) {
        Some(pattern) => Some(compile(lineno, pattern)?),
        None => None,
    };
    Ok(AllowEntry {
        feedtype,
        hosts,
        ok,
        not,
    })
}

fn parse_request(
    lineno: usize,
    args: &[String],
    feedtypes: &FeedtypeTable,
) -> Result<RequestEntry, AccessFileError> {
    if args.len() < 3 || args.len() > 4 {
        return Err(bad(
            lineno,
            "REQUEST needs feedtype, pattern, host[:port], [mode]",
        ));
    }
    let feedtype =
        parse_feedtype(feedtypes, &args[0]).map_err(|err| bad(lineno, err.to_string()))?;
    let pattern = compile(lineno, &args[1])?;
    let (host, port) = match args[2].rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| bad(lineno, format!("bad port {:?}", port)))?,
        ),
        None => (args[2].clone(), DEFAULT_PORT),
    };
    let mode = parse_mode(lineno, args.get(3))?;
    Ok(RequestEntry {
        feedtype,
        pattern,
        host,
        port,
        mode,
    })
}

fn parse_accept(
    lineno: usize,
    args: &[String],
    feedtypes: &FeedtypeTable,
) -> Result<AcceptEntry, AccessFileError> {
    if args.len() < 3 || args.len() > 4 {
        return Err(bad(
            lineno,
            "ACCEPT needs feedtype, pattern, host, [primary|alternate]",
        ));
    }
    let feedtype =
        parse_feedtype(feedtypes, &args[0]).map_err(|err| bad(lineno, err.to_string()))?;
    let pattern = compile(lineno, &args[1])?;
    let hosts = HostPattern::classify(&args[2]).map_err(|err| bad(lineno, err.to_string()))?;
    let mode = parse_mode(lineno, args.get(3))?;
    Ok(AcceptEntry {
        feedtype,
        pattern,
        hosts,
        mode,
    })
}

fn parse_mode(lineno: usize, arg: Option<&String>) -> Result<TransferMode, AccessFileError> {
    match arg.map(String::as_str) {
        None | Some("primary") => Ok(TransferMode::Primary),
        Some("alternate") => Ok(TransferMode::Alternate),
        Some(other) => Err(bad(lineno, format!("unknown transfer mode {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedtype::builtin_table;

    const SAMPLE: &str = r#"
# Core feeds for the campus cluster
ALLOW   IDS|DDPLUS  ^node[0-9]\.example\.edu$   .*      ^DO_NOT
ALLOW   NMC         128.117
REQUEST WMO         .*          up.example.edu:1388
REQUEST CONDUIT     ^data2      backup.example.edu      alternate
ACCEPT  NEXRD2      ^SDUS5.     ^ingest\.example\.net$  alternate
EXEC    "pqact -f ANY etc/pqact.conf"
"#;

    #[test]
    fn aclparse_sample_file() {
        let table = parse_access_str(SAMPLE, &builtin_table()).unwrap();
        assert_eq!(table.allow.len(), 2);
        assert_eq!(table.request.len(), 2);
        assert_eq!(table.accept.len(), 1);
        assert_eq!(table.exec.len(), 1);

        assert_eq!(table.request[0].port, 1388);
        assert_eq!(table.request[1].port, DEFAULT_PORT);
        assert_eq!(table.request[1].mode, TransferMode::Alternate);
        assert_eq!(table.accept[0].mode, TransferMode::Alternate);
        assert_eq!(
            table.exec[0].argv,
            vec!["pqact", "-f", "ANY", "etc/pqact.conf"]
        );
        // Defaulted ok pattern admits everything.
        assert!(table.allow[1].ok.matches("whatever"));
    }

    #[test]
    fn aclparse_rejects_unknown_keyword() {
        let err = parse_access_str("PERMIT ANY host", &builtin_table()).unwrap_err();
        assert!(matches!(err, AccessFileError::BadEntry { line: 1, .. }));
    }

    #[test]
    fn aclparse_rejects_bad_feedtype() {
        let err = parse_access_str("ALLOW NOSUCH host.example", &builtin_table()).unwrap_err();
        assert!(err.to_string().contains("NOSUCH"));
    }

    #[test]
    fn aclparse_rejects_bad_port() {
        let err = parse_access_str(
            "REQUEST WMO .* up.example.edu:notaport",
            &builtin_table(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn aclparse_comment_only_lines_ignored() {
        let table = parse_access_str("# nothing\n\n   \n", &builtin_table()).unwrap();
        assert!(table.allow.is_empty() && table.request.is_empty());
    }
}
