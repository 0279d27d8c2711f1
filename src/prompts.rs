//! Extraction prompt templates, selected per dictionary by name.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — tuning a layout's extraction rules means
//!    editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect prompts and the context
//!    instruction directly without a live model.
//!
//! Each template carries a `{context_instruction}` placeholder filled by
//! [`render`] with the image enumeration for the job's context window.

/// Diacritized Arabic-only dictionaries. Output: JSON object keyed by
/// headword, with the `__continuation__` marker for split entries.
pub const ARABIC_ONLY_WITH_DIACRITICS: &str = r#"
You are given page image(s) from an Arabic dictionary with fully diacritized text.

{context_instruction}

Extract data as a JSON object (dictionary) with this structure:
{"word1": "definition1", "word2": "definition2", ...}

CRITICAL INSTRUCTIONS FOR OCR:
- Preserve ALL diacritics (تشكيل) exactly as they appear: فَتْحَة، كَسْرَة، ضَمَّة، سُكُون، شَدَّة، تَنْوِين
- Extract the Arabic headword WITH full diacritics
- Extract the Arabic definition/content WITH full diacritics
- The headword is typically bold, larger, or at the start of an entry

HANDLING CONTINUATIONS:
- If the CURRENT page starts with text that continues a previous entry (no new headword at top):
  - Use the special key "__continuation__" with the continued text
  - Example: {"__continuation__": "continued definition text...", "nextWord": "definition..."}

Return only valid JSON object (not an array).
"#;

/// Two-column bilingual English–Arabic dictionaries, RTL column flow.
/// Output: JSON array of term entries with continuation flags.
pub const ENGLISH_ARABIC_WITH_CONTEXT: &str = r#"
You are given page image(s) from a bilingual English-Arabic dictionary.

{context_instruction}

This dictionary has a two-column layout flowing right-to-left (RTL).

Extract data as a JSON array with this structure:
[{"english":"...", "arabic":"...", "arabic_term":"...", "is_continuation": false}]

FIELD DESCRIPTIONS:
- "english": The English term or phrase
- "arabic": The full Arabic text for this entry (definitions, notes, field markers)
- "arabic_term": A UNIQUE Arabic phrase that distinguishes this entry
  * Include context/field markers if present (e.g., "شطب [هندسة ميكانيكية]")
  * Different technical meanings should have different arabic_term values
- "is_continuation": true if continuing from previous page, false otherwise

HANDLING CONTINUATIONS:
- If the CURRENT page starts with text continuing a previous entry, mark it with "is_continuation": true

Return only valid JSON array.
"#;

/// Bilingual dictionaries with sequential (non-columnar) entries.
pub const FLAT_ENGLISH_ARABIC_WITH_CONTEXT: &str = r#"
You are given page image(s) from a bilingual English-Arabic dictionary with sequential entries (not two-column).

{context_instruction}

Extract data as a JSON array with this structure:
[{"english":"...", "arabic":"...", "arabic_term":"...", "is_continuation": false}]

FIELD DESCRIPTIONS:
- "english": The English term or phrase
- "arabic": The full Arabic text for this entry (definitions, notes, field markers)
- "arabic_term": A UNIQUE Arabic phrase that distinguishes this entry
  * Include context/field markers if present
  * Different technical meanings should have different arabic_term values
- "is_continuation": true if continuing from previous page, false otherwise

HANDLING CONTINUATIONS:
- If the CURRENT page starts with text continuing a previous entry, mark it with "is_continuation": true

Return only valid JSON array.
"#;

/// Simple translation dictionaries: term pairs without long definitions.
pub const ENGLISH_ARABIC_TRANSLATION: &str = r#"
You are given page image(s) from a bilingual English-Arabic translation dictionary.

{context_instruction}

Extract data as a JSON array with this structure:
[{"english":"...", "arabic":"...", "arabic_term":"..."}]

FIELD DESCRIPTIONS:
- "english": The English term or phrase
- "arabic": The Arabic translation/equivalent
- "arabic_term": A UNIQUE Arabic identifier for this entry

This is a simple translation dictionary - extract term pairs without extensive definitions.

Return only valid JSON array.
"#;

/// Trilingual French–English–Arabic dictionaries.
pub const FRENCH_ENGLISH_ARABIC_WITH_CONTEXT: &str = r#"
You are given page image(s) from a trilingual French-English-Arabic dictionary.

{context_instruction}

Extract data as a JSON array with this structure:
[{"french":"...", "english":"...", "arabic":"...", "arabic_term":"...", "is_continuation": false}]

FIELD DESCRIPTIONS:
- "french": The French term or phrase
- "english": The English term or phrase (may be empty if not present)
- "arabic": The full Arabic text for this entry (definitions, notes)
- "arabic_term": A UNIQUE Arabic phrase that distinguishes this entry
- "is_continuation": true if continuing from previous page, false otherwise

Return only valid JSON array.
"#;

/// Commentary on the Seven Muʿallaqāt: verse-keyed poetry layout.
pub const ARABIC_POETRY: &str = r#"
You are given page image(s) from "شرح المعلقات السبع" (Commentary on the Seven Mu'allaqat).

{context_instruction}

PAGE LAYOUT:
- Header at TOP: "معلقة [poet name]" (e.g., معلقة لبيد بن ربيعة)
- Verses numbered: ١ - ٢ - ٣ - (Arabic numerals with dash)
- Each verse appears in BOLD/DISTINCT text on its own line
- The explanation (شرح) follows below the verse in regular text

Extract data as a JSON object:
{
  "معلقة لبيد بن ربيعة. ١- عفت الديار": "عفا لازم ومتعد، يقال: عفت الريح المنزل...",
  "معلقة لبيد بن ربيعة. ٢- فمدافع الريان": "المدافع: أماكن يندفع عنها الماء..."
}

KEY FORMAT: "معلقة [poet name]. [number]- [first 2 words of verse]"
VALUE: The full explanation text that follows the verse

CRITICAL:
- Extract poet name from page header
- Use Arabic numerals (١، ٢، ٣)
- KEY has only FIRST 2 WORDS of the verse
- VALUE is the complete شرح (explanation) for that verse
- Preserve ALL diacritics (تشكيل)

HANDLING CONTINUATIONS:
- If page starts mid-explanation, use "__continuation__" key

Return only valid JSON object.
"#;

/// Look up a template by its registered name.
///
/// Unknown names fall back to [`ARABIC_ONLY_WITH_DIACRITICS`], the most
/// common layout, so a typo in a descriptor degrades gracefully instead of
/// stalling the whole dictionary.
pub fn resolve(name: &str) -> &'static str {
    match name {
        "arabic_only_with_diacritics" => ARABIC_ONLY_WITH_DIACRITICS,
        "english_arabic_dictionary_with_context" => ENGLISH_ARABIC_WITH_CONTEXT,
        "flat_english_arabic_dictionary_with_context" => FLAT_ENGLISH_ARABIC_WITH_CONTEXT,
        "english_arabic_dictionary_translation" => ENGLISH_ARABIC_TRANSLATION,
        "french_english_arabic_dictionary_with_context" => FRENCH_ENGLISH_ARABIC_WITH_CONTEXT,
        "arabic_poetry" => ARABIC_POETRY,
        _ => ARABIC_ONLY_WITH_DIACRITICS,
    }
}

/// Build the instruction describing which images are context and which is
/// the current page.
///
/// With no context window (or on page 1, which has no predecessors) this
/// degrades to a single-page instruction.
pub fn context_instruction(context_pages: u32, page_num: u32) -> String {
    if context_pages == 0 || page_num == 1 {
        return "Extract all entries from this single page image.".to_string();
    }

    let actual_context = context_pages.min(page_num - 1);
    if actual_context == 0 {
        return "Extract all entries from this single page image.".to_string();
    }

    let mut lines = vec!["IMAGES PROVIDED (in order):".to_string()];
    for i in 0..actual_context {
        lines.push(format!(
            "- Image {}: Page {} (context)",
            i + 1,
            page_num - actual_context + i
        ));
    }
    lines.push(format!(
        "- Image {}: Page {} (CURRENT - extract from this one)",
        actual_context + 1,
        page_num
    ));
    lines.push(String::new());
    lines.push("The LAST image is the CURRENT page - extract entries ONLY from it.".to_string());
    lines.push("Previous image(s) are for VISUAL CONTEXT only.".to_string());
    lines.join("\n")
}

/// Render the full prompt text for a job: template + context instruction.
pub fn render(prompt_name: &str, context_pages: u32, page_num: u32) -> String {
    resolve(prompt_name).replace(
        "{context_instruction}",
        &context_instruction(context_pages, page_num),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_prompt_falls_back() {
        assert_eq!(resolve("no_such_layout"), ARABIC_ONLY_WITH_DIACRITICS);
        assert_eq!(resolve("arabic_poetry"), ARABIC_POETRY);
    }

    #[test]
    fn first_page_gets_single_page_instruction() {
        let instr = context_instruction(2, 1);
        assert_eq!(instr, "Extract all entries from this single page image.");
    }

    #[test]
    fn zero_context_gets_single_page_instruction() {
        let instr = context_instruction(0, 57);
        assert_eq!(instr, "Extract all entries from this single page image.");
    }

    #[test]
    fn context_instruction_enumerates_images() {
        let instr = context_instruction(2, 10);
        assert!(instr.contains("- Image 1: Page 8 (context)"));
        assert!(instr.contains("- Image 2: Page 9 (context)"));
        assert!(instr.contains("- Image 3: Page 10 (CURRENT - extract from this one)"));
    }

    #[test]
    fn context_window_shrinks_near_document_start() {
        // Page 2 with a 3-page window has only page 1 as context.
        let instr = context_instruction(3, 2);
        assert!(instr.contains("- Image 1: Page 1 (context)"));
        assert!(instr.contains("- Image 2: Page 2 (CURRENT"));
        assert!(!instr.contains("Image 3"));
    }

    #[test]
    fn render_substitutes_placeholder() {
        let prompt = render("arabic_only_with_diacritics", 1, 5);
        assert!(!prompt.contains("{context_instruction}"));
        assert!(prompt.contains("- Image 1: Page 4 (context)"));
        assert!(prompt.contains("تشكيل"));
    }
}
