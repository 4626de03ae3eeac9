//! Facet discovery.
//!
//! Expands the configured source patterns into a deterministic, ordered set
//! of facet definitions. The scan is a pure function of file contents and
//! options: identical inputs always yield identical, identically-ordered
//! output, which is what keeps the downstream diff stable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use alloy_core::primitives::FixedBytes;

use crate::artifacts::ContractArtifact;
use crate::error::GemcutError;

/// A 4-byte function selector.
pub type Selector = FixedBytes<4>;

/// One scanned facet contract. Immutable once scanned for a given run.
#[derive(Debug, Clone)]
pub struct FacetDefinition {
    /// Contract name, derived from the source file stem.
    pub name: String,
    /// Source file this facet was scanned from.
    pub source_path: PathBuf,
    /// Exposed selectors, ascending.
    pub selectors: Vec<Selector>,
    /// Canonical signature per selector.
    pub signature_by_selector: BTreeMap<Selector, String>,
    /// Full Solidity declaration per selector, for interface generation.
    pub declaration_by_selector: BTreeMap<Selector, String>,
    /// SHA-256 of the facet's creation bytecode, hex encoded.
    pub code_fingerprint: String,
    /// Creation bytecode, deployed verbatim.
    pub bytecode: Vec<u8>,
}

/// Options controlling a scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Folder holding compiled build artifacts.
    pub artifacts_dir: PathBuf,
    /// Include `public` functions in addition to `external` ones.
    pub public_methods: bool,
    /// Reserved core facet names; a scanned facet may not use one.
    pub reserved_names: BTreeSet<String>,
}

/// Function visibility as declared in Solidity source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    External,
    Public,
    Other,
}

/// Expand the source patterns and scan every matched facet.
///
/// Patterns are expanded in declared order, matched paths are de-duplicated
/// and sorted lexicographically, so filesystem iteration order never affects
/// the result.
pub fn scan(patterns: &[String], opts: &ScanOptions) -> Result<Vec<FacetDefinition>, GemcutError> {
    let mut paths: BTreeSet<PathBuf> = BTreeSet::new();
    for pattern in patterns {
        let entries = glob::glob(pattern).map_err(|e| GemcutError::Scan {
            path: PathBuf::from(pattern),
            reason: format!("invalid glob pattern: {e}"),
        })?;
        for entry in entries {
            let path = entry.map_err(|e| GemcutError::Scan {
                path: PathBuf::from(pattern),
                reason: format!("failed to read glob entry: {e}"),
            })?;
            if path.is_file() {
                paths.insert(path);
            }
        }
    }

    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut facets = Vec::with_capacity(paths.len());
    for path in paths {
        let facet = scan_file(&path, opts)?;
        if let Some(first) = seen.get(&facet.name) {
            return Err(GemcutError::DuplicateFacet {
                name: facet.name,
                first: first.clone(),
                second: path,
            });
        }
        seen.insert(facet.name.clone(), path);
        facets.push(facet);
    }

    tracing::debug!(count = facets.len(), "Facet scan complete");
    Ok(facets)
}

/// Scan a single facet source file and its build artifact.
fn scan_file(path: &Path, opts: &ScanOptions) -> Result<FacetDefinition, GemcutError> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| GemcutError::Scan {
            path: path.to_path_buf(),
            reason: "source file has no usable stem".to_string(),
        })?
        .to_string();

    if opts.reserved_names.contains(&name) {
        return Err(GemcutError::Scan {
            path: path.to_path_buf(),
            reason: format!("`{name}` is a reserved core facet name"),
        });
    }

    let source = std::fs::read_to_string(path).map_err(|e| GemcutError::Scan {
        path: path.to_path_buf(),
        reason: format!("failed to read source: {e}"),
    })?;
    let visibility = function_visibility(&source);

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let artifact = ContractArtifact::load(&opts.artifacts_dir, file_name, &name)?;

    let mut signature_by_selector = BTreeMap::new();
    let mut declaration_by_selector = BTreeMap::new();
    for (selector, signature) in &artifact.signature_by_selector {
        let fn_name = signature.split('(').next().unwrap_or_default();
        // Functions absent from the source scan are compiler-generated
        // getters for public state variables; treat them as public.
        let included = match visibility.get(fn_name).copied().unwrap_or(Visibility::Public) {
            Visibility::External => true,
            Visibility::Public => opts.public_methods,
            Visibility::Other => false,
        };
        if !included {
            continue;
        }
        signature_by_selector.insert(*selector, signature.clone());
        if let Some(decl) = artifact.declaration_by_selector.get(selector) {
            declaration_by_selector.insert(*selector, decl.clone());
        }
    }

    let selectors: Vec<Selector> = signature_by_selector.keys().copied().collect();

    Ok(FacetDefinition {
        name,
        source_path: path.to_path_buf(),
        selectors,
        signature_by_selector,
        declaration_by_selector,
        code_fingerprint: artifact.code_fingerprint,
        bytecode: artifact.bytecode,
    })
}

/// Extract declared visibility per function name from Solidity source.
///
/// This is a keyword scan over comment-stripped source, not a full parser:
/// it finds each `function <name>(...)` header and looks for a visibility
/// keyword between the closing parenthesis of the parameter list and the
/// body (`{`) or terminator (`;`). Overloads sharing a name but differing in
/// visibility are resolved to the most permissive declaration.
fn function_visibility(source: &str) -> BTreeMap<String, Visibility> {
    let stripped = strip_comments(source);
    let bytes = stripped.as_bytes();
    let mut out: BTreeMap<String, Visibility> = BTreeMap::new();

    let mut idx = 0;
    while let Some(pos) = stripped[idx..].find("function") {
        let start = idx + pos;
        idx = start + "function".len();

        // Must be a standalone keyword.
        let before_ok = start == 0 || !is_ident_char(bytes[start - 1]);
        let after = &stripped[idx..];
        if !before_ok || !after.starts_with(|c: char| c.is_whitespace()) {
            continue;
        }

        let rest = after.trim_start();
        let name: String = rest
            .chars()
            .take_while(|c| c.is_ascii() && is_ident_char(*c as u8))
            .collect();
        if name.is_empty() {
            continue;
        }

        let Some(open) = rest.find('(') else { continue };
        let Some(close) = matching_paren(&rest[open..]) else {
            continue;
        };
        let header_start = open + close + 1;
        let header_end = rest[header_start..]
            .find(['{', ';'])
            .map(|p| header_start + p)
            .unwrap_or(rest.len());
        let header = &rest[header_start..header_end];

        let vis = if has_keyword(header, "external") {
            Visibility::External
        } else if has_keyword(header, "public") {
            Visibility::Public
        } else {
            Visibility::Other
        };

        out.entry(name)
            .and_modify(|existing| {
                if vis == Visibility::External
                    || (vis == Visibility::Public && *existing == Visibility::Other)
                {
                    *existing = vis;
                }
            })
            .or_insert(vis);
    }

    out
}

/// Offset of the parenthesis matching the one at `s[0]`.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn has_keyword(header: &str, keyword: &str) -> bool {
    header.split_whitespace().any(|w| w == keyword)
}

/// Remove `//` line comments and `/* */` block comments.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' {
            match chars.peek() {
                Some('/') => {
                    for n in chars.by_ref() {
                        if n == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = ' ';
                    for n in chars.by_ref() {
                        if prev == '*' && n == '/' {
                            break;
                        }
                        prev = n;
                    }
                    out.push(' ');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACET_SOURCE: &str = r#"
        // SPDX-License-Identifier: MIT
        pragma solidity 0.8.21;

        contract ExampleFacet {
            uint256 public counter;

            function getValue(address owner) external view returns (uint256) {
                return 1;
            }

            function setValue(uint256 value) public {
                // function keyword inside a comment: function bogus() external
            }

            function helper() internal pure returns (uint256) {
                return 2;
            }

            /* block comment with function fake() external */
            function compute(uint256 a, uint256 b) private pure returns (uint256) {
                return a + b;
            }
        }
    "#;

    #[test]
    fn test_visibility_scan() {
        let vis = function_visibility(FACET_SOURCE);
        assert_eq!(vis.get("getValue"), Some(&Visibility::External));
        assert_eq!(vis.get("setValue"), Some(&Visibility::Public));
        assert_eq!(vis.get("helper"), Some(&Visibility::Other));
        assert_eq!(vis.get("compute"), Some(&Visibility::Other));
        assert!(vis.get("bogus").is_none());
        assert!(vis.get("fake").is_none());
    }

    #[test]
    fn test_visibility_overload_takes_most_permissive() {
        let source = r#"
            contract C {
                function f(uint256 a) internal {}
                function f(uint256 a, uint256 b) external {}
            }
        "#;
        let vis = function_visibility(source);
        assert_eq!(vis.get("f"), Some(&Visibility::External));
    }

    #[test]
    fn test_visibility_scan_stops_names_at_non_ascii() {
        // 'Ł' shares its low byte with 'A'; a name must not absorb it.
        let source = "contract C { function payŁoad() external {} }";
        let vis = function_visibility(source);
        assert!(vis.get("payŁoad").is_none());
        assert_eq!(vis.get("pay"), Some(&Visibility::External));
    }

    #[test]
    fn test_strip_comments_preserves_code() {
        let stripped = strip_comments("a // x\nb /* y */ c");
        assert_eq!(stripped, "a \nb   c");
    }

    fn write_facet(
        dir: &Path,
        name: &str,
        source: &str,
        identifiers: serde_json::Value,
    ) {
        let src_dir = dir.join("src/facets");
        std::fs::create_dir_all(&src_dir).unwrap();
        std::fs::write(src_dir.join(format!("{name}.sol")), source).unwrap();

        let out_dir = dir.join("out").join(format!("{name}.sol"));
        std::fs::create_dir_all(&out_dir).unwrap();
        let artifact = serde_json::json!({
            "abi": [],
            "bytecode": {"object": "0x60806040"},
            "methodIdentifiers": identifiers,
        });
        std::fs::write(
            out_dir.join(format!("{name}.json")),
            serde_json::to_string(&artifact).unwrap(),
        )
        .unwrap();
    }

    fn options(dir: &Path) -> ScanOptions {
        ScanOptions {
            artifacts_dir: dir.join("out"),
            public_methods: false,
            reserved_names: BTreeSet::from(["DiamondCutFacet".to_string()]),
        }
    }

    #[test]
    fn test_scan_is_deterministic() {
        let tmp = tempdir::TempDir::new("gemcut-scan").unwrap();
        let dir = tmp.path();
        write_facet(
            dir,
            "BFacet",
            "contract BFacet { function transfer(address to, uint256 amount) external {} }",
            serde_json::json!({"transfer(address,uint256)": "a9059cbb"}),
        );
        write_facet(
            dir,
            "AFacet",
            "contract AFacet { function balanceOf(address owner) external view returns (uint256) {} }",
            serde_json::json!({"balanceOf(address)": "70a08231"}),
        );

        let pattern = dir
            .join("src/facets/*Facet.sol")
            .to_string_lossy()
            .to_string();
        let opts = options(dir);

        let first = scan(&[pattern.clone()], &opts).unwrap();
        let second = scan(&[pattern.clone(), pattern], &opts).unwrap();

        // Sorted lexicographically, duplicates collapsed, identical output.
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "AFacet");
        assert_eq!(first[1].name, "BFacet");
        assert_eq!(second.len(), 2);
        assert_eq!(
            first.iter().map(|f| &f.name).collect::<Vec<_>>(),
            second.iter().map(|f| &f.name).collect::<Vec<_>>()
        );
        assert_eq!(first[0].selectors, second[0].selectors);
    }

    #[test]
    fn test_scan_public_methods_toggle() {
        let tmp = tempdir::TempDir::new("gemcut-scan").unwrap();
        let dir = tmp.path();
        write_facet(
            dir,
            "MixedFacet",
            "contract MixedFacet {
                function transfer(address to, uint256 amount) external {}
                function approve(address spender, uint256 amount) public {}
            }",
            serde_json::json!({
                "transfer(address,uint256)": "a9059cbb",
                "approve(address,uint256)": "095ea7b3"
            }),
        );

        let pattern = dir
            .join("src/facets/*Facet.sol")
            .to_string_lossy()
            .to_string();

        let externals_only = scan(&[pattern.clone()], &options(dir)).unwrap();
        assert_eq!(externals_only[0].selectors.len(), 1);

        let mut opts = options(dir);
        opts.public_methods = true;
        let with_public = scan(&[pattern], &opts).unwrap();
        assert_eq!(with_public[0].selectors.len(), 2);
    }

    #[test]
    fn test_scan_rejects_reserved_name() {
        let tmp = tempdir::TempDir::new("gemcut-scan").unwrap();
        let dir = tmp.path();
        write_facet(
            dir,
            "DiamondCutFacet",
            "contract DiamondCutFacet { function init(address owner) external {} }",
            serde_json::json!({"init(address)": "19ab453c"}),
        );

        let pattern = dir
            .join("src/facets/*Facet.sol")
            .to_string_lossy()
            .to_string();
        let err = scan(&[pattern], &options(dir)).unwrap_err();
        assert!(matches!(err, GemcutError::Scan { .. }));
    }
}
