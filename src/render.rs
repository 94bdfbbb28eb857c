//! Drawing of task graphs.
//!
//! Graphs are laid out left to right: every task sits in the column of its
//! depth, tasks of a column are stacked by name, and arrows go from a
//! dependency to its dependents. Rendering is pure, the same graph always
//! produces the same document.

use std::fmt::{self, Display};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::graph::{TaskGraph, TaskNode};

const BOX_HEIGHT: usize = 36;
const CHAR_WIDTH: usize = 8;
const BOX_PADDING: usize = 24;
const COLUMN_GAP: usize = 64;
const ROW_GAP: usize = 20;
const MARGIN: usize = 16;

/// Renders a graph as an SVG document. Pass the graph returned by
/// [`TaskGraph::without_roots`] to get the view shown to users.
pub fn render_svg(graph: &TaskGraph) -> String {
    Svg(graph).to_string()
}

/// Renders a graph as a mermaid flowchart.
pub fn render_mermaid(graph: &TaskGraph) -> String {
    Mermaid(graph).to_string()
}

/// Wraps an SVG document into a URI usable as an `<img>` source.
pub fn to_data_uri(svg: &str) -> String {
    format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg))
}

struct Svg<'a>(&'a TaskGraph);

struct Placed<'a> {
    node: &'a TaskNode,
    x: usize,
    y: usize,
    width: usize,
}

impl Svg<'_> {
    fn layout(&self) -> (Vec<Placed<'_>>, usize, usize) {
        let nodes = self.0.topological_order();
        let columns = nodes.iter().map(|n| n.depth + 1).max().unwrap_or(0);

        let mut widths = vec![0; columns];
        let mut rows = vec![0; columns];
        for node in &nodes {
            let width = node.name.chars().count() * CHAR_WIDTH + BOX_PADDING;
            widths[node.depth] = widths[node.depth].max(width);
        }

        let mut offsets = Vec::with_capacity(columns);
        let mut x = MARGIN;
        for width in &widths {
            offsets.push(x);
            x += width + COLUMN_GAP;
        }

        let mut placed = Vec::with_capacity(nodes.len());
        for node in nodes {
            let row = rows[node.depth];
            rows[node.depth] += 1;
            placed.push(Placed {
                node,
                x: offsets[node.depth],
                y: MARGIN + row * (BOX_HEIGHT + ROW_GAP),
                width: widths[node.depth],
            });
        }

        let width = x - COLUMN_GAP + MARGIN;
        let height = rows.iter().max().copied().unwrap_or(0) * (BOX_HEIGHT + ROW_GAP) - ROW_GAP
            + 2 * MARGIN;

        (placed, width, height)
    }
}

impl Display for Svg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(
                f,
                r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg">
    <text x="10" y="30" font-family="sans-serif">No task to display</text>
</svg>"#
            );
        }

        let (placed, width, height) = self.layout();

        write!(
            f,
            r##"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg">
    <style>
        text {{
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, sans-serif;
            font-size: 13px;
            fill: #1f2937;
        }}
        .task {{ fill: #ecfdf5; stroke: #00a960; stroke-width: 1.5; rx: 6; }}
        .edge {{ fill: none; stroke: #6b7280; stroke-width: 1.2; }}
    </style>
    <defs>
        <marker id="arrow" viewBox="0 0 10 10" refX="10" refY="5"
                markerWidth="8" markerHeight="8" orient="auto-start-reverse">
            <path d="M 0 0 L 10 5 L 0 10 z" fill="#6b7280" />
        </marker>
    </defs>
    <rect width="100%" height="100%" fill="white" />
"##
        )?;

        for (source, target) in self.0.edges() {
            let (Some(a), Some(b)) = (
                placed.iter().find(|p| p.node.name == source),
                placed.iter().find(|p| p.node.name == target),
            ) else {
                continue;
            };

            let (x1, y1) = (a.x + a.width, a.y + BOX_HEIGHT / 2);
            let (x2, y2) = (b.x, b.y + BOX_HEIGHT / 2);
            let bend = (x2.saturating_sub(x1)) / 2;

            writeln!(
                f,
                r#"    <path class="edge" marker-end="url(#arrow)"
        d="M {x1} {y1} C {c1} {y1}, {c2} {y2}, {x2} {y2}" />"#,
                c1 = x1 + bend,
                c2 = x2.saturating_sub(bend),
            )?;
        }

        for p in &placed {
            let name = escape(&p.node.name);
            writeln!(
                f,
                r#"    <rect class="task" x="{x}" y="{y}" width="{w}" height="{h}">
        <title>{name}</title>
    </rect>
    <text x="{tx}" y="{ty}" text-anchor="middle" dominant-baseline="middle">{name}</text>"#,
                x = p.x,
                y = p.y,
                w = p.width,
                h = BOX_HEIGHT,
                tx = p.x + p.width / 2,
                ty = p.y + BOX_HEIGHT / 2,
            )?;
        }

        f.write_str("</svg>")
    }
}

struct Mermaid<'a>(&'a TaskGraph);

impl Display for Mermaid<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let nodes = self.0.topological_order();
        let id = |name: &str| nodes.iter().position(|n| n.name == name).unwrap_or(0);

        for (i, node) in nodes.iter().enumerate() {
            let name = node.name.replace('"', "\\\"");
            writeln!(f, "    {i}[\"{name}\"]")?;
        }

        for (source, target) in self.0.edges() {
            writeln!(f, "    {} --> {}", id(source), id(target))?;
        }

        Ok(())
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;
    use crate::graph::build;

    fn view() -> TaskGraph {
        let text = "[A]\n[B]\ninput = \"A\"\n[C]\ninput = \"B\"\n[D]\ninput = \"B\"\n";
        let config = parse(text).unwrap();
        build(&config).unwrap().without_roots()
    }

    #[test]
    fn test_svg_contains_tasks_and_edges() {
        let svg = render_svg(&view());

        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains(">B</text>"));
        assert!(svg.contains(">C</text>"));
        assert!(svg.contains(">D</text>"));
        assert!(!svg.contains(">A</text>"));
        assert_eq!(svg.matches("class=\"edge\"").count(), 2);
    }

    #[test]
    fn test_svg_is_deterministic() {
        assert_eq!(render_svg(&view()), render_svg(&view()));
    }

    #[test]
    fn test_empty_graph_renders_placeholder() {
        let config = parse("[Alone]\n").unwrap();
        let svg = render_svg(&build(&config).unwrap().without_roots());

        assert!(svg.contains("No task to display"));
    }

    #[test]
    fn test_names_are_escaped() {
        let config = parse("[\"a<b\"]\n").unwrap();
        let svg = render_svg(&build(&config).unwrap());

        assert!(svg.contains("a&lt;b"));
    }

    #[test]
    fn test_mermaid() {
        let mermaid = render_mermaid(&view());

        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("0[\"B\"]"));
        assert!(mermaid.contains("0 --> 1"));
        assert!(mermaid.contains("0 --> 2"));
    }

    #[test]
    fn test_data_uri() {
        assert_eq!(
            to_data_uri("<svg/>"),
            "data:image/svg+xml;base64,PHN2Zy8+"
        );
    }
}
