use crate::models::AnalysisResult;
use pulldown_cmark::{Options, Parser};

/// Run-level context shown in the report header.
#[derive(Debug, Clone)]
pub struct ReportMeta {
    pub test_set_name: String,
    pub baseline_system_prompt: String,
    pub candidate_system_prompt: String,
    pub model_id: String,
}

/// Self-contained HTML evaluation report.
pub struct HtmlReport;

const STYLE: &str = "\
body { font-family: sans-serif; margin: 2em; color: #222; }
h1 { font-size: 1.4em; }
dl.meta dt { font-weight: bold; margin-top: 0.5em; }
dl.meta dd { margin-left: 0; white-space: pre-wrap; }
table { border-collapse: collapse; width: 100%; margin-top: 1.5em; }
th, td { border: 1px solid #bbb; padding: 0.5em; vertical-align: top; text-align: left; }
th { background: #eee; }
td.score { text-align: right; white-space: nowrap; }
p.overall { font-size: 1.1em; font-weight: bold; margin-top: 1.5em; }
";

/// Render one markdown cell. Each cell gets its own parser so markdown
/// state (open fences, list nesting) never leaks between rows.
fn render_markdown(text: &str) -> String {
    let parser = Parser::new_ext(text, Options::empty());
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Aggregate grade across all rows with a valid numeric grade.
///
/// The sum of grades is banded against the valid-grade count: at or below
/// `-valid` reads as much worse, any negative as worse, zero as same,
/// below `valid` as better, anything above as much better.
fn overall_grade(results: &[AnalysisResult]) -> String {
    let numeric: Vec<i64> = results
        .iter()
        .filter_map(|r| r.llm_grade.numeric())
        .collect();
    let valid = numeric.len() as i64;
    if valid == 0 {
        return "no valid grades".to_string();
    }
    let total: i64 = numeric.iter().sum();

    let label = if total <= -valid {
        "much worse"
    } else if total < 0 {
        "worse"
    } else if total == 0 {
        "same"
    } else if total < valid {
        "better"
    } else {
        "much better"
    };
    format!("{label} ({total:+})")
}

impl HtmlReport {
    pub fn generate(results: &[AnalysisResult], meta: &ReportMeta) -> String {
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str(&format!(
            "<title>Evaluation Report: {}</title>\n",
            escape_html(&meta.test_set_name)
        ));
        html.push_str(&format!("<style>\n{STYLE}</style>\n</head>\n<body>\n"));
        html.push_str(&format!(
            "<h1>Evaluation Report: {}</h1>\n",
            escape_html(&meta.test_set_name)
        ));

        html.push_str("<dl class=\"meta\">\n");
        html.push_str(&format!(
            "<dt>Model</dt><dd>{}</dd>\n",
            escape_html(&meta.model_id)
        ));
        html.push_str(&format!(
            "<dt>Baseline system prompt</dt><dd>{}</dd>\n",
            escape_html(&meta.baseline_system_prompt)
        ));
        html.push_str(&format!(
            "<dt>Candidate system prompt</dt><dd>{}</dd>\n",
            escape_html(&meta.candidate_system_prompt)
        ));
        html.push_str("</dl>\n");

        if results.is_empty() {
            html.push_str("<p>No results to report.</p>\n");
        } else {
            html.push_str("<table>\n<tr>");
            for header in [
                "Input",
                "Baseline Output",
                "Current Output",
                "Similarity",
                "Grade &amp; Feedback",
            ] {
                html.push_str(&format!("<th>{header}</th>"));
            }
            html.push_str("</tr>\n");

            for result in results {
                html.push_str("<tr>");
                html.push_str(&format!("<td>{}</td>", render_markdown(&result.input_text)));
                html.push_str(&format!(
                    "<td>{}</td>",
                    render_markdown(&result.baseline_output)
                ));
                html.push_str(&format!(
                    "<td>{}</td>",
                    render_markdown(&result.current_output)
                ));
                html.push_str(&format!(
                    "<td class=\"score\">{:.2}</td>",
                    result.similarity_score
                ));
                html.push_str(&format!(
                    "<td><strong>{}</strong>{}</td>",
                    escape_html(&result.llm_grade.to_string()),
                    render_markdown(&result.llm_feedback)
                ));
                html.push_str("</tr>\n");
            }
            html.push_str("</table>\n");
        }

        html.push_str(&format!(
            "<p class=\"overall\">Overall: {}</p>\n",
            escape_html(&overall_grade(results))
        ));
        html.push_str("</body>\n</html>\n");
        html
    }
}
