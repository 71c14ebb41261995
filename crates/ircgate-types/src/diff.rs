/// Renders an edit as a sed-style substitution of the words that changed.
///
/// Common leading and trailing words are dropped, so `"helo world"` to
/// `"hello world"` becomes `s/helo/hello/`. When nothing was removed (a pure
/// insertion) the whole text is used so the substitution stays unambiguous.
pub fn seddiff(previous: &str, current: &str) -> String {
    if previous.is_empty() {
        return current.to_string();
    }

    let old: Vec<&str> = previous.split(' ').collect();
    let new: Vec<&str> = current.split(' ').collect();

    let prefix = old
        .iter()
        .zip(&new)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed = old[prefix..old.len() - suffix].join(" ");
    let added = new[prefix..new.len() - suffix].join(" ");

    if removed.is_empty() {
        format!("s/{}/{}/", previous, current)
    } else {
        format!("s/{}/{}/", removed, added)
    }
}
