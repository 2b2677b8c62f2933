//! Tarjan's strongly connected components.

use std::collections::BTreeMap;

use super::Edge;

struct Tarjan<'a> {
    adjacency: BTreeMap<&'a str, Vec<&'a str>>,
    index: BTreeMap<&'a str, usize>,
    lowlink: BTreeMap<&'a str, usize>,
    on_stack: BTreeMap<&'a str, bool>,
    stack: Vec<&'a str>,
    next: usize,
    components: Vec<Vec<&'a str>>,
}

impl<'a> Tarjan<'a> {
    fn visit(&mut self, node: &'a str) {
        self.index.insert(node, self.next);
        self.lowlink.insert(node, self.next);
        self.next += 1;
        self.stack.push(node);
        self.on_stack.insert(node, true);

        let successors = self.adjacency.get(node).cloned().unwrap_or_default();
        for succ in successors {
            if !self.index.contains_key(succ) {
                self.visit(succ);
                let low = self.lowlink[succ].min(self.lowlink[node]);
                self.lowlink.insert(node, low);
            } else if self.on_stack.get(succ).copied().unwrap_or(false) {
                let low = self.index[succ].min(self.lowlink[node]);
                self.lowlink.insert(node, low);
            }
        }

        if self.lowlink[node] == self.index[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.insert(member, false);
                component.push(member);
                if member == node {
                    break;
                }
            }
            component.sort();
            self.components.push(component);
        }
    }
}

/// Components of the graph over `nodes` formed by `edges` (child to parent).
/// Edges with an endpoint outside `nodes` are ignored.
pub(super) fn strongly_connected<'a>(nodes: &[&'a String], edges: &[&'a Edge]) -> Vec<Vec<&'a String>> {
    let by_name: BTreeMap<&str, &'a String> = nodes.iter().map(|&n| (n.as_str(), n)).collect();

    let mut adjacency: BTreeMap<&'a str, Vec<&'a str>> = BTreeMap::new();
    for &edge in edges {
        if by_name.contains_key(edge.table.as_str()) && by_name.contains_key(edge.parent.as_str()) {
            adjacency
                .entry(edge.table.as_str())
                .or_default()
                .push(edge.parent.as_str());
        }
    }

    let mut tarjan = Tarjan {
        adjacency,
        index: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        on_stack: BTreeMap::new(),
        stack: Vec::new(),
        next: 0,
        components: Vec::new(),
    };
    for &node in nodes {
        if !tarjan.index.contains_key(node.as_str()) {
            tarjan.visit(node.as_str());
        }
    }

    tarjan
        .components
        .into_iter()
        .map(|c| c.into_iter().filter_map(|n| by_name.get(n).copied()).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(table: &str, parent: &str) -> Edge {
        Edge {
            table: table.into(),
            constraint: format!("{}_{}_fk", table, parent),
            parent: parent.into(),
        }
    }

    #[test]
    fn test_components() {
        let names: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let nodes: Vec<&String> = names.iter().collect();
        let edges = [edge("a", "b"), edge("b", "a"), edge("c", "a"), edge("d", "d")];
        let refs: Vec<&Edge> = edges.iter().collect();

        let mut components: Vec<Vec<String>> = strongly_connected(&nodes, &refs)
            .into_iter()
            .map(|c| c.into_iter().cloned().collect())
            .collect();
        components.sort();
        assert_eq!(
            components,
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()], vec!["d".to_string()]]
        );
    }
}
