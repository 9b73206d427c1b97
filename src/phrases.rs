use crate::conll::SentenceMatrix;
use crate::vocabulary::Vocabulary;

/// Multi-word-expression matcher consumed by the example provider.
///
/// Implementations recognize lexicalized phrases in the dependency tree of a sentence and
/// rewrite the sentence so each phrase appears as a single token line. The tree matching
/// itself lives outside of this crate.
pub trait PhraseMatcher: Send + Sync {

    /// Rewrites `sentence` in place, substituting recognized phrases.
    fn put_phrases_into_sentence(&self, sentence: &mut SentenceMatrix);

    /// Groups of `(row, weight)` to fold after training: the first row of every group
    /// receives the weighted sum of all rows of the group. Used to merge transient phrase
    /// vectors back into their syntactic head word.
    fn transient_groups(&self, vocabulary: &Vocabulary) -> Vec<Vec<(usize, f32)>> {
        let _ = vocabulary;
        Vec::new()
    }
}
