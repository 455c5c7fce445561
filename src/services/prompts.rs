//! Prompt text for every completion call. Each builder embeds the reply
//! skeleton of the type it expects back.

use crate::core::models::ChapterId;

pub fn character_recon(known_characters_json: &str, chapter_text: &str, schema: &str) -> String {
    format!(
        "Identify the characters mentioned in the chapter below.\
        \n\nInstructions:\
        \n1. Study the KNOWN CHARACTERS list. Every character has a unique `id`, a `name` and `aliases`.\
        \n2. Read the CHAPTER TEXT and match names, aliases and titles to known characters.\
        \n3. For every known character that is mentioned, return its exact `id`.\
        \n4. For every character that is not in the list, return the name used in the text.\
        \n\nRules:\
        \n- `mentioned_existing_character_ids` may only contain ids from the list.\
        \n- `newly_discovered_names` must only contain characters that are certainly absent from the list.\
        \n- Ignore generic references (\"the girl\", \"an old man\") unless they are an established alias.\
        \n\nReply with a single JSON object shaped like:\n{}\
        \n\nKNOWN CHARACTERS:\n{}\
        \n\nCHAPTER TEXT:\n{}",
        schema, known_characters_json, chapter_text
    )
}

pub fn character_patches(
    relevant_characters_json: &str,
    new_names: &[String],
    chapter_text: &str,
    chapter: ChapterId,
    schema: &str,
) -> String {
    let new_names_block = if new_names.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nNEWLY DISCOVERED NAMES:\n{}",
            serde_json::to_string_pretty(new_names).unwrap_or_default()
        )
    };

    format!(
        "You maintain a character database. Produce a JSON patch holding ONLY changes and additions.\
        \n\nUpdating an existing character: you MUST include its exact `id`. `name` may be omitted.\
        \nCreating a new character: leave `id` out. `name` is mandatory.\
        \n\nPatch rules:\
        \n- Only return characters whose data changes in this chapter.\
        \n- `description`: a synthesis of the old information and the new facts. May contain spoilers.\
        \n- `spoiler_free_description`: short, intriguing, and free of key events.\
        \n- `aliases`: add every title and alternative name used in this chapter.\
        \n- `chapter_mentions`: add exactly ONE entry keyed \"{}\" summarising the character's actions here.\
        \n- Never touch `first_mention`.\
        \n\nReply with a single JSON object shaped like:\n{}\
        \n\nEXISTING CHARACTERS:\n{}{}\
        \n\nCHAPTER TEXT ({}):\n{}",
        chapter,
        schema,
        relevant_characters_json,
        new_names_block,
        chapter.location(),
        chapter_text
    )
}

pub fn chapter_summary(chapter_text: &str, schema: &str) -> String {
    format!(
        "You are an experienced literary editor. Write two retellings of the chapter below.\
        \n- `teaser`: 40 to 60 words that introduce the setup WITHOUT spoilers.\
        \n- `synopsis`: 100 to 150 words covering every key event and turn, in order. It is context for other models.\
        \n\nReply with a single JSON object shaped like:\n{}\
        \n\nCHAPTER TEXT:\n{}",
        schema, chapter_text
    )
}

pub fn script(
    chapter_text: &str,
    character_aliases_json: &str,
    synopsis: Option<&str>,
    narrator_label: &str,
    schema: &str,
) -> String {
    let synopsis_block = synopsis
        .map(|s| format!("\n\nCHAPTER SYNOPSIS FOR CONTEXT:\n{}", s))
        .unwrap_or_default();

    format!(
        "You are a director turning a book chapter into an audio drama script.\
        \nConvert the CHAPTER TEXT into an ordered list of lines.{}\
        \n\nCHARACTERS AND THEIR ALIASES:\n{}\
        \n\nMarkup rules:\
        \n1. `type` is `narration` for description and action, `dialogue` for direct speech.\
        \n2. `speaker` of narration is \"{}\", except for a character's quoted inner thoughts, which belong to that character.\
        \n3. `speaker` of dialogue is the character's main name from the list. Never use \"Unknown\": give a temporary role such as \"Merchant\" instead.\
        \n4. Dialogue `text` holds only the spoken words, without speech tags like \"he said\".\
        \n5. Keep the order of the text. Do not skip or merge passages.\
        \n\nReply with a single JSON object shaped like:\n{}\
        \n\nCHAPTER TEXT:\n{}",
        synopsis_block, character_aliases_json, narrator_label, schema, chapter_text
    )
}

pub fn ambient(lines_json: &str, library_json: &str, schema: &str) -> String {
    format!(
        "You are a sound designer. Find the exact lines where the background atmosphere changes and pick a sound for each from the AMBIENT LIBRARY.\
        \nRefer to lines by their `id`. If the atmosphere never changes, return an empty `transitions` list.\
        \n\nReply with a single JSON object shaped like:\n{}\
        \n\nAMBIENT LIBRARY:\n{}\
        \n\nSCRIPT LINES:\n{}",
        schema, library_json, lines_json
    )
}

pub fn emotion(lines_json: &str, profiles_json: &str, emotions_json: &str, schema: &str) -> String {
    format!(
        "You are the director of an audio theatre. For EVERY line below choose ONE emotion from the list, \
        taking the character descriptions and the context into account.\
        \n\nReply with a single JSON object shaped like:\n{}\
        \n\nAVAILABLE EMOTIONS:\n{}\
        \n\nCHARACTERS:\n{}\
        \n\nLINES:\n{}",
        schema, emotions_json, profiles_json, lines_json
    )
}
