//! Pipeline stages for PDF-to-SQL exam processing.
//!
//! Each submodule implements exactly one step. Steps that depend on an
//! external capability expose a trait ([`render::Rasterizer`],
//! [`ocr::OcrEngine`], [`detect::DiagramDetector`], [`llm::LanguageModel`],
//! [`sql::SqlGenerator`]) so the orchestration can be tested with fakes.
//!
//! ## Data Flow
//!
//! ```text
//! intake ──▶ render ──▶ ocr ──▶ detect ──▶ merge ──▶ llm
//! (copy)     (pdfium)   (tsv)   (boxes)    (crops)   (per page JSON)
//!
//! aggregate ──▶ sql
//! (merged_data.json)  (<label>_output.sql)
//! ```
//!
//! 1. [`intake`]: copy or download the selection into `uploads/`
//! 2. [`render`]: rasterise every page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`ocr`]: one text file per page image
//! 4. [`detect`]: diagram bounding boxes, annotated page copies
//! 5. [`merge`]: page text plus cropped diagrams → `diagram_info.json`
//! 6. [`llm`]: one model call per page, one response file per page
//! 7. [`aggregate`]: merge response lists into one collection
//! 8. [`sql`]: SQL text from the merged collection
//!
//! [`encode`] and [`postprocess`] are helpers of the LLM and SQL steps.

pub mod aggregate;
pub mod detect;
pub mod encode;
pub mod intake;
pub mod llm;
pub mod merge;
pub mod ocr;
pub mod postprocess;
pub mod render;
pub mod sql;
