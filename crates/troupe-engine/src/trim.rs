//! Group-chat output trimming.
//!
//! Models prompted with a multi-party transcript sometimes keep going and
//! speak for the rest of the cast. The trim pass cuts the generation at the
//! first line that opens another participant's turn (`Name:`), keeping only
//! the speaker's own text.

/// Truncate `text` at the first line starting with a non-speaker
/// participant's display name followed by `:`. A leading `Speaker:` prefix
/// on the first line is stripped as well.
pub fn trim_foreign_turns(text: &str, speaker_name: &str, other_names: &[String]) -> String {
    let mut kept = String::with_capacity(text.len());

    for (idx, line) in text.split('\n').enumerate() {
        let mut line = line;
        if idx == 0 {
            // Models often echo the priming prefix back.
            if let Some(rest) = strip_name_prefix(line, speaker_name) {
                line = rest;
            }
        }
        if other_names
            .iter()
            .any(|name| strip_name_prefix(line, name).is_some())
        {
            break;
        }
        if idx > 0 {
            kept.push('\n');
        }
        kept.push_str(line);
    }

    kept.trim_end().to_string()
}

/// `"Name: rest"` → `Some("rest")`, tolerating leading whitespace.
fn strip_name_prefix<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix(name)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.trim_start())
}
