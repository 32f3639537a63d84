use std::fs;
use std::path::Path;

use tracing::warn;

/// Normalize a subject selection into a flat, ordered, de-duplicated list.
///
/// A single token naming an existing regular file is read and split on
/// commas and newlines; otherwise every token is split on commas. `None`
/// is returned for "all subjects" and is the only way an empty selection
/// is represented.
pub fn resolve_subjects<I, S>(tokens: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let tokens: Vec<String> = tokens
        .into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let mut raw: Vec<String> = Vec::new();
    if tokens.len() == 1 && Path::new(&tokens[0]).is_file() {
        match fs::read_to_string(&tokens[0]) {
            Ok(content) => raw.extend(content.split([',', '\n']).map(str::to_string)),
            Err(e) => {
                warn!(path = %tokens[0], error = %e, "could not read subjects file");
                return None;
            }
        }
    } else {
        for t in &tokens {
            raw.extend(t.split(',').map(str::to_string));
        }
    }

    let mut subjects: Vec<String> = Vec::new();
    for s in raw {
        let s = s.trim();
        if !s.is_empty() && !subjects.iter().any(|seen| seen == s) {
            subjects.push(s.to_string());
        }
    }
    if subjects.is_empty() {
        None
    } else {
        Some(subjects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_list_tokens() {
        assert_eq!(
            resolve_subjects(["sub-001", " sub-002 "]),
            Some(vec!["sub-001".to_string(), "sub-002".to_string()])
        );
    }

    #[test]
    fn splits_comma_string() {
        assert_eq!(
            resolve_subjects(Some("sub-001, sub-002")),
            Some(vec!["sub-001".to_string(), "sub-002".to_string()])
        );
    }

    #[test]
    fn splits_each_token_on_commas_and_deduplicates() {
        assert_eq!(
            resolve_subjects(["sub-001,sub-002", "sub-003", "sub-001"]),
            Some(vec![
                "sub-001".to_string(),
                "sub-002".to_string(),
                "sub-003".to_string()
            ])
        );
    }

    #[test]
    fn reads_subjects_file_with_mixed_separators() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = dir.path().join("subjects.txt");
        fs::write(&f, "sub-001\nsub-002,sub-003\n\n").expect("write subjects");
        let arg = f.to_string_lossy().to_string();
        assert_eq!(
            resolve_subjects([arg.as_str()]),
            Some(vec![
                "sub-001".to_string(),
                "sub-002".to_string(),
                "sub-003".to_string()
            ])
        );
    }

    #[test]
    fn empty_selection_is_none() {
        assert_eq!(resolve_subjects(None::<&str>), None);
        assert_eq!(resolve_subjects(Vec::<String>::new()), None);
        assert_eq!(resolve_subjects([" , ", ""]), None);
    }

    #[test]
    fn empty_subjects_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = dir.path().join("subjects.txt");
        fs::write(&f, "\n,\n").expect("write subjects");
        assert_eq!(resolve_subjects([f.to_string_lossy()]), None);
    }
}
