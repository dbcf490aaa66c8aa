//! Newick export. See §6: standard Newick, at least six significant digits on every
//! branch length.
use std::fmt::Write as _;

use crate::tree::{NodeId, Tree};

/// Renders `tree` as a single Newick string terminated by `;`.
pub fn export_newick(tree: &Tree) -> String {
    let mut out = String::new();
    write_node(tree, tree.root(), &mut out);
    out.push(';');
    out
}

fn write_node(tree: &Tree, id: NodeId, out: &mut String) {
    let node = tree.node(id);
    match node.children {
        Some([left, right]) => {
            out.push('(');
            write_node(tree, left, out);
            out.push(',');
            write_node(tree, right, out);
            out.push(')');
        }
        None => {
            if let Some(name) = &node.sample_name {
                out.push_str(&escape(name));
            }
        }
    }
    if let Some(blength) = node.branch_length {
        // 6 significant digits regardless of magnitude (branch lengths span roughly
        // 1e-9 to 1.0), which fixed-point decimal notation cannot guarantee.
        let _ = write!(out, ":{blength:.5e}");
    }
}

/// Newick reserves `()[]':;,` and whitespace inside unquoted labels; quote any label
/// that contains one.
fn escape(name: &str) -> String {
    if name.chars().any(|c| "()[]':;, \t\n".contains(c)) {
        format!("'{}'", name.replace('\'', "''"))
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region_list::RegionList;

    fn leaf_regions() -> RegionList {
        RegionList::from_mutations(&[], 4).unwrap()
    }

    #[test]
    fn single_leaf_tree_has_no_parentheses() {
        let tree = Tree::new_single_leaf("only".to_string(), leaf_regions());
        let newick = export_newick(&tree);
        assert_eq!(newick, "only;");
    }

    #[test]
    fn two_leaves_render_as_a_cherry() {
        let mut tree = Tree::new_single_leaf("a".to_string(), leaf_regions());
        let root = tree.root();
        tree.graft_sibling(root, "b".to_string(), leaf_regions(), 0.1, 0.1);
        let newick = export_newick(&tree);
        assert!(newick.starts_with('('));
        assert!(newick.contains('a'));
        assert!(newick.contains('b'));
        assert!(newick.ends_with(";"));
    }

    #[test]
    fn labels_needing_quotes_are_quoted() {
        assert_eq!(escape("sample one"), "'sample one'");
        assert_eq!(escape("plain"), "plain");
    }
}
