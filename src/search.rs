/// Case-folded fuzzy matching shared by the owners and items query
/// handlers: a query matches a candidate when its characters appear in
/// order, and matches are ranked by edit distance so tighter names sort
/// first. A negative rank means no match.
pub const NO_MATCH: i32 = -1;

pub const MAX_RESULTS: usize = 10;

fn fold(value: &str) -> Vec<char> {
    value.chars().flat_map(|c| c.to_lowercase()).collect()
}

fn is_subsequence(needle: &[char], haystack: &[char]) -> bool {
    let mut position = 0;
    for c in haystack {
        if position == needle.len() {
            break;
        }
        if *c == needle[position] {
            position += 1;
        }
    }
    position == needle.len()
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut previous_diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous_diagonal + usize::from(ca != cb);
            previous_diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

/// Rank of `candidate` against `query`: edit distance when the folded query
/// is an in-order subsequence of the folded candidate, `NO_MATCH` otherwise.
pub fn rank_match_fold(query: &str, candidate: &str) -> i32 {
    let query = fold(query);
    let candidate = fold(candidate);
    if !is_subsequence(&query, &candidate) {
        return NO_MATCH;
    }
    levenshtein(&query, &candidate) as i32
}

/// Top matches ascending by rank, negatives filtered, capped at
/// `MAX_RESULTS`. Ties break on the candidate itself so results are stable.
pub fn rank_all<'a, I>(query: &str, candidates: I) -> Vec<(String, i32)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut ranked: Vec<(String, i32)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let rank = rank_match_fold(query, candidate);
            (rank >= 0).then(|| (candidate.to_owned(), rank))
        })
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(MAX_RESULTS);
    ranked
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_match_ranks_zero() {
        assert_eq!(rank_match_fold("thrall", "thrall"), 0);
        assert_eq!(rank_match_fold("Thrall", "thrall"), 0);
        assert_eq!(rank_match_fold("THRALL", "Thrall"), 0);
    }

    #[test]
    fn missing_characters_do_not_match() {
        assert_eq!(rank_match_fold("thrall", "jaina"), NO_MATCH);
        // out-of-order characters are not a subsequence
        assert_eq!(rank_match_fold("ba", "ab"), NO_MATCH);
    }

    #[test]
    fn closer_names_rank_lower() {
        let short = rank_match_fold("iron", "ironforge");
        let long = rank_match_fold("iron", "ironbeard the third");
        assert!(short >= 0 && long >= 0);
        assert!(short < long);
    }

    #[test]
    fn rank_all_filters_sorts_and_caps() {
        let candidates = vec!["ironforge", "jaina", "iron", "irondeep mine"];
        let ranked = rank_all("iron", candidates.iter().copied());

        assert_eq!(ranked[0].0, "iron");
        assert_eq!(ranked[0].1, 0);
        assert!(ranked.iter().all(|(_, rank)| *rank >= 0));
        assert!(!ranked.iter().any(|(name, _)| name == "jaina"));

        let many: Vec<String> = (0..30).map(|n| format!("iron-{n:02}")).collect();
        let ranked = rank_all("iron", many.iter().map(|s| s.as_str()));
        assert_eq!(ranked.len(), MAX_RESULTS);
    }

    #[test]
    fn empty_query_matches_everything_at_name_length() {
        assert_eq!(rank_match_fold("", "abc"), 3);
    }
}
