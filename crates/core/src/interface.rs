//! Aggregate proxy interface generation.
//!
//! Merges the declarations of every active facet into one `IDiamondProxy`
//! Solidity interface, in the same deterministic order the diff engine uses
//! (facet discovery order, ascending selector within a facet). Identical
//! declarations contributed by multiple facets collapse to one entry;
//! divergent signatures sharing a selector are already rejected upstream.

use std::path::PathBuf;

use crate::config::Config;
use crate::error::GemcutError;
use crate::scanner::FacetDefinition;

/// Render the aggregate interface source. Pure.
pub fn generate(facets: &[FacetDefinition], config: &Config) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "// SPDX-License-Identifier: {}\n",
        config.solc.license
    ));
    out.push_str(&format!("pragma solidity {};\n\n", config.solc.version));
    out.push_str("// Generated by gemcut. DO NOT EDIT.\n\n");

    for import in &config.generator.proxy_interface.imports {
        out.push_str(&format!("import \"{import}\";\n"));
    }
    if !config.generator.proxy_interface.imports.is_empty() {
        out.push('\n');
    }

    out.push_str("interface IDiamondProxy {\n");
    let mut seen: Vec<&str> = Vec::new();
    for facet in facets {
        // A facet with no remaining selectors contributes nothing.
        for selector in &facet.selectors {
            let Some(declaration) = facet.declaration_by_selector.get(selector) else {
                continue;
            };
            if seen.contains(&declaration.as_str()) {
                continue;
            }
            seen.push(declaration);
            out.push_str(&format!("    {declaration}\n"));
        }
    }
    out.push_str("}\n");
    out
}

/// Render and write the interface to the configured destination.
///
/// The file is regenerated in full on every pass, never patched, and written
/// temp-then-rename so readers never observe a half-written interface.
pub fn write_interface(
    facets: &[FacetDefinition],
    config: &Config,
) -> Result<PathBuf, GemcutError> {
    let path = &config.paths.generated.interface;
    let source = generate(facets, config);

    let io_err = |reason: String| GemcutError::Scan {
        path: path.clone(),
        reason,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| io_err(format!("failed to create output directory: {e}")))?;
    }
    let tmp_path = path.with_extension("sol.tmp");
    std::fs::write(&tmp_path, &source)
        .map_err(|e| io_err(format!("failed to write generated interface: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| io_err(format!("failed to commit generated interface: {e}")))?;

    tracing::info!(path = %path.display(), "Generated proxy interface");
    Ok(path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Selector;
    use std::collections::BTreeMap;

    fn facet(name: &str, declarations: &[(u32, &str)]) -> FacetDefinition {
        let declaration_by_selector: BTreeMap<Selector, String> = declarations
            .iter()
            .map(|(v, d)| (Selector::from(v.to_be_bytes()), d.to_string()))
            .collect();
        FacetDefinition {
            name: name.to_string(),
            source_path: PathBuf::from(format!("src/facets/{name}.sol")),
            selectors: declaration_by_selector.keys().copied().collect(),
            signature_by_selector: BTreeMap::new(),
            declaration_by_selector,
            code_fingerprint: "f".to_string(),
            bytecode: Vec::new(),
        }
    }

    fn config_with_imports(imports: &[&str]) -> Config {
        let mut config = Config::default();
        config.generator.proxy_interface.imports =
            imports.iter().map(|i| i.to_string()).collect();
        config
    }

    #[test]
    fn test_generate_orders_and_frames_output() {
        let facets = vec![
            facet("BFacet", &[(2, "function b() external;")]),
            facet("AFacet", &[(1, "function a() external;")]),
        ];
        let source = generate(&facets, &config_with_imports(&["src/shared/Structs.sol"]));

        assert!(source.starts_with("// SPDX-License-Identifier: MIT\npragma solidity 0.8.21;\n"));
        assert!(source.contains("import \"src/shared/Structs.sol\";"));
        // Facet discovery order, not alphabetical by declaration.
        let b_pos = source.find("function b()").unwrap();
        let a_pos = source.find("function a()").unwrap();
        assert!(b_pos < a_pos);
        assert!(source.trim_end().ends_with('}'));
    }

    #[test]
    fn test_generate_deduplicates_identical_declarations() {
        let facets = vec![
            facet("AFacet", &[(1, "function shared() external;")]),
            facet("BFacet", &[(2, "function shared() external;")]),
        ];
        let source = generate(&facets, &Config::default());
        assert_eq!(source.matches("function shared()").count(), 1);
    }

    #[test]
    fn test_generate_is_byte_identical_across_runs() {
        let facets = vec![facet("AFacet", &[(1, "function a() external;")])];
        let config = Config::default();
        assert_eq!(generate(&facets, &config), generate(&facets, &config));
    }

    #[test]
    fn test_write_interface_creates_destination() {
        let tmp = tempdir::TempDir::new("gemcut-iface").unwrap();
        let mut config = Config::default();
        config.paths.generated.interface = tmp.path().join("generated/IDiamondProxy.sol");

        let facets = vec![facet("AFacet", &[(1, "function a() external;")])];
        let path = write_interface(&facets, &config).unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("interface IDiamondProxy"));
        assert!(written.contains("function a() external;"));
    }
}
