//! String similarities used by the fuzzy matching of list entities. All of them work on chars
//! and return a value between 0 and 1, 1 meaning identical.

/// Number of single char edits needed to go from `a` to `b`
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut previous_diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous_diagonal + if ca == cb { 0 } else { 1 };
            previous_diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

pub fn levenshtein_similarity(a: &str, b: &str) -> f32 {
    let len = a.chars().count().max(b.chars().count());
    if len == 0 {
        return 1.0;
    }
    (len - levenshtein_distance(a, b)) as f32 / len as f32
}

/// Case insensitive Jaro-Winkler similarity
pub fn jaro_winkler_similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.to_uppercase().chars().collect();
    let b: Vec<char> = b.to_uppercase().chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let range = (a.len().max(b.len()) / 2).saturating_sub(1);
    let mut a_matches = vec![false; a.len()];
    let mut b_matches = vec![false; b.len()];
    let mut nb_matches = 0;
    for (i, ca) in a.iter().enumerate() {
        let low = i.saturating_sub(range);
        let high = (i + range).min(b.len() - 1);
        for j in low..=high {
            if !b_matches[j] && *ca == b[j] {
                a_matches[i] = true;
                b_matches[j] = true;
                nb_matches += 1;
                break;
            }
        }
    }
    if nb_matches == 0 {
        return 0.0;
    }

    let a_matched = a.iter().zip(a_matches.iter()).filter(|(_, m)| **m).map(|(c, _)| c);
    let b_matched = b.iter().zip(b_matches.iter()).filter(|(_, m)| **m).map(|(c, _)| c);
    let transpositions = a_matched.zip(b_matched).filter(|(ca, cb)| ca != cb).count();

    let m = nb_matches as f32;
    let mut weight =
        (m / a.len() as f32 + m / b.len() as f32 + (m - transpositions as f32 / 2.0) / m) / 3.0;
    if weight > 0.7 {
        let prefix = a
            .iter()
            .zip(b.iter())
            .take(4)
            .take_while(|(ca, cb)| ca == cb)
            .count();
        weight += prefix as f32 * 0.1 * (1.0 - weight);
    }
    weight
}
