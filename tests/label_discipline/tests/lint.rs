//! Repo-wide lint: the closed `EntityType`/`RelationshipType` enums in
//! `kg-types` are the only place a graph label or relationship-type wire
//! name may appear as a string literal. Every other `.rs` file must go
//! through `EntityType::graph_label()` / `RelationshipType::as_str()`.

use std::fs;
use std::path::{Path, PathBuf};

const GRAPH_LABELS: &[&str] = &[
    "File", "Directory", "PROJECT", "Function", "Class", "Method", "Variable", "Concept",
    "Pattern", "CodeExample", "Document",
];

const RELATIONSHIP_NAMES: &[&str] = &[
    "CONTAINS",
    "IMPORTS",
    "DEFINES",
    "COORDINATES",
    "IMPLEMENTS",
    "RELATES_TO",
    "HAS_CONCEPT",
    "DEPENDS_ON",
];

/// Files allowed to hold the literal definitions.
fn is_exempt(path: &Path) -> bool {
    path.ends_with("crates/kg-types/src/lib.rs")
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().and_then(|n| n.to_str()) == Some("target") {
                continue;
            }
            walk(&path, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root should exist")
}

#[test]
fn no_raw_graph_labels_outside_the_closed_enum() {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in ["crates", "apps"] {
        walk(&root.join(dir), &mut files);
    }

    let mut violations = Vec::new();
    for path in &files {
        if is_exempt(path) {
            continue;
        }
        let Ok(content) = fs::read_to_string(path) else { continue };
        for (line_no, line) in content.lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") {
                continue;
            }
            for label in GRAPH_LABELS.iter().chain(RELATIONSHIP_NAMES.iter()) {
                let quoted = format!("\"{label}\"");
                if line.contains(&quoted) {
                    violations.push(format!(
                        "{}:{}: raw literal {quoted} — use EntityType::graph_label() or RelationshipType::as_str()",
                        path.display(),
                        line_no + 1
                    ));
                }
            }
        }
    }

    assert!(
        violations.is_empty(),
        "found raw graph-label/relationship-name literals outside the closed enums:\n{}",
        violations.join("\n")
    );
}
