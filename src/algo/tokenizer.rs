use unicode_segmentation::UnicodeSegmentation;

/// Tokenize text into lowercase word tokens, filtering stopwords, ticket
/// boilerplate words and short or numeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !is_numeric(w) && !is_stopword(w))
        .collect()
}

fn is_numeric(word: &str) -> bool {
    word.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',')
}

fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "the" | "for" | "with" | "from" | "and" | "but" | "not" | "are" | "was"
        | "were" | "been" | "being" | "have" | "has" | "had" | "does" | "did" | "will"
        | "would" | "could" | "should" | "may" | "might" | "shall" | "can" | "this"
        | "that" | "these" | "those" | "there" | "here" | "where" | "when" | "what"
        | "which" | "who" | "whom" | "how" | "all" | "each" | "every" | "both" | "few"
        | "more" | "most" | "other" | "some" | "such" | "nor" | "only" | "own" | "same"
        | "than" | "too" | "very" | "just" | "because" | "about" | "into" | "through"
        | "during" | "before" | "after" | "above" | "below" | "between" | "under"
        | "again" | "further" | "then" | "once" | "any" | "its" | "your" | "our"
        | "their" | "his" | "her" | "also" | "you" | "they" | "she" | "him" | "them"
        // ticket boilerplate and the labels of the comparison string
        | "system" | "service" | "subarea" | "title" | "description" | "ticket"
        | "request" | "issue" | "hello" | "please" | "thanks" | "thank" | "regards"
        | "dear" | "team" | "good" | "morning" | "afternoon" | "n/a"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_basic() {
        let tokens = tokenize("Hello World! This is a login test.");
        assert_eq!(tokens, vec!["world", "login", "test"]);
    }

    #[test]
    fn tokenize_filters_short_and_numeric() {
        let tokens = tokenize("I am on v2 error 504 at 10.30 gateway");
        assert_eq!(tokens, vec!["error", "gateway"]);
    }

    #[test]
    fn tokenize_drops_comparison_labels() {
        let tokens = tokenize("SYSTEM: Billing | SERVICE: Invoices | TITLE: Timeout");
        assert_eq!(tokens, vec!["billing", "invoices", "timeout"]);
    }
}
