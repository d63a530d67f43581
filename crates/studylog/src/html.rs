use scraper::node::Node;
use scraper::{ElementRef, Html};

/// Elements that end their paragraph
const PARAGRAPH_ELEMENTS: &[&str] = &[
    "p", "pre", "ul", "ol", "table", "blockquote", "h1", "h2", "h3", "h4", "h5", "h6",
];

/// Elements that only end their line
const LINE_ELEMENTS: &[&str] = &["div", "li", "tr"];

/// Convert a problem statement's HTML into readable plain text.
///
/// Entities are decoded by the parser. `<sup>` is rendered as `^` so that
/// constraints like `10<sup>4</sup>` survive as `10^4`.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    collect_text(fragment.root_element(), false, &mut out);
    tidy_lines(&out)
}

fn collect_text(element: ElementRef<'_>, in_pre: bool, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                if in_pre || !text.trim().is_empty() {
                    out.push_str(text);
                } else if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                    out.push(' ');
                }
            }
            Node::Element(el) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = el.name();
                match name {
                    "br" => out.push('\n'),
                    "sup" => out.push('^'),
                    "li" => {
                        if !out.is_empty() && !out.ends_with('\n') {
                            out.push('\n');
                        }
                        out.push_str("- ");
                    }
                    _ => {}
                }
                collect_text(child_el, in_pre || name == "pre", out);
                if PARAGRAPH_ELEMENTS.contains(&name) {
                    out.push_str("\n\n");
                } else if LINE_ELEMENTS.contains(&name) {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

fn tidy_lines(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_blank = false;

    for line in raw.split('\n') {
        let line = line.replace('\u{a0}', " ");
        let line = line.trim();
        if line.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if pending_blank {
                out.push('\n');
            }
        }
        out.push_str(line);
        pending_blank = false;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_and_decodes_entities() {
        let html = "<p>Given an array <code>nums</code> &amp; an integer&nbsp;<code>target</code>.</p>";
        assert_eq!(
            html_to_text(html),
            "Given an array nums & an integer target."
        );
    }

    #[test]
    fn keeps_structure_of_examples_and_constraints() {
        let html = "<p>Return the indices.</p>\n\n<p>&nbsp;</p>\n<p><strong>Constraints:</strong></p>\n\
                    <ul>\n\t<li><code>2 &lt;= nums.length &lt;= 10<sup>4</sup></code></li>\n\
                    \t<li>Only one valid answer exists.</li>\n</ul>";
        assert_eq!(
            html_to_text(html),
            "Return the indices.\n\nConstraints:\n\n- 2 <= nums.length <= 10^4\n- Only one valid answer exists."
        );
    }

    #[test]
    fn preformatted_lines_are_kept() {
        let html = "<pre><strong>Input:</strong> nums = [2,7]\n<strong>Output:</strong> [0,1]</pre>";
        assert_eq!(html_to_text(html), "Input: nums = [2,7]\nOutput: [0,1]");
    }

    #[test]
    fn empty_input_gives_empty_text() {
        assert_eq!(html_to_text(""), "");
        assert_eq!(html_to_text("<p> </p>"), "");
    }
}
