//! Prompts for exam-page extraction and SQL generation.
//!
//! Centralising every prompt here keeps the LLM stage free of prompt text,
//! and lets unit tests inspect prompts without a live model.
//!
//! Callers can override the page prompt via
//! [`crate::config::WorkflowConfig::system_prompt`]; the constants here are
//! used only when no override is provided.

use crate::pipeline::merge::DiagramPage;
use std::fmt::Write as _;

/// Default system prompt for turning one exam page into question records.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert at digitising printed exam papers. You receive the OCR text of ONE page of an exam, a list of diagrams detected on that page and, when available, the page image itself.

Extract every question on the page into a JSON array. Each element is an object with these keys:

- "question_number": the number or label printed next to the question, as a string (e.g. "1", "2(b)", "IV")
- "question_text": the full question text, corrected for obvious OCR errors only when you are certain
- "options": an array of answer options for multiple-choice questions, in printed order, without their "(a)"/"A." labels; an empty array otherwise
- "answer": the correct answer if it is printed on the page, otherwise null
- "marks": the marks awarded for the question as a number if printed, otherwise null
- "diagrams": an array of diagram ids (from the provided list) that belong to this question; an empty array if none

Rules:
1. Keep the questions in the order they appear on the page.
2. A question continued from a previous page is still extracted with whatever part is visible.
3. Ignore page headers, footers, page numbers and instructions that are not questions.
4. If the page contains no questions, return [].
5. Output ONLY the JSON array. No Markdown fences, no commentary."#;

/// System prompt used when the SQL text is written by the model.
pub const SQL_SYSTEM_PROMPT: &str = r#"You are a database engineer. You receive a JSON array of exam question records extracted from a PDF.

Write SQL that stores every record:
1. Start with a CREATE TABLE IF NOT EXISTS statement for the given table name, with one column per record key and sensible column types.
2. Follow with one INSERT statement per record, in the order given.
3. Store nested arrays and objects as JSON text.
4. Escape string literals correctly.

Output ONLY the SQL. No Markdown fences, no commentary."#;

/// Build the user message for one page.
pub fn page_user_message(page: &DiagramPage) -> String {
    let mut msg = String::new();
    let _ = writeln!(msg, "Page {} ({})", page.page_number, page.page);
    msg.push('\n');

    msg.push_str("OCR text:\n\"\"\"\n");
    if page.ocr_missing || page.text.trim().is_empty() {
        msg.push_str("(no text was recognised on this page)\n");
    } else {
        msg.push_str(page.text.trim_end());
        msg.push('\n');
    }
    msg.push_str("\"\"\"\n\n");

    if page.diagrams.is_empty() {
        msg.push_str("Detected diagrams: none\n");
    } else {
        msg.push_str("Detected diagrams:\n");
        for d in &page.diagrams {
            let _ = writeln!(
                msg,
                "- {} ({}, confidence {:.2}) at x1={:.0} y1={:.0} x2={:.0} y2={:.0}",
                d.id, d.label, d.confidence, d.bbox.x1, d.bbox.y1, d.bbox.x2, d.bbox.y2
            );
        }
    }
    msg
}

/// Build the user message for model-written SQL.
pub fn sql_user_message(table: &str, merged_json: &str) -> String {
    format!("Table name: {table}\n\nRecords:\n{merged_json}")
}
