//! A character trie over a vocabulary, plus the beam-pruned dynamic programming that turns it
//! into a spellchecker and a word segmenter.
//!
//! The trie is the search graph: every path from the root to a leaf spells a dictionary word.
//! Matching an input string against it is edit-distance DP where one axis is the input and the
//! other is *the whole trie at once* — each column holds a best loss per trie node, so all
//! dictionary words are aligned simultaneously and share their common prefixes. Three moves give
//! the usual edit operations: `left` stays on a node and consumes an input character (insertion),
//! `diag` steps to a child while consuming a character (match or substitution), `down` steps to a
//! child consuming nothing (deletion). For segmentation a fourth, `transition`, re-enters the
//! root when a leaf completes so the next word can start, carrying a back-pointer to where the
//! previous word ended. Beam pruning keeps each column's survivors within a margin of its best.
//!
//! The same trellis-and-back-pointer shape reappears in the audio decoder over HMM graphs; here
//! the graph is a tree of characters and the costs are small integers.
use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

const INF: u32 = u32::MAX;

/// Edit costs for trie matching. The defaults suit single-word spellcheck; connected text wants
/// [`MatchCosts::boosted`] so a word boundary is cheap relative to edits and the segmenter stops
/// shredding long words into short ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchCosts {
    /// Consuming an input character without moving in the trie.
    pub left: u32,
    /// Stepping to a child on a mismatched character.
    pub diag: u32,
    /// Stepping to a child without consuming input.
    pub down: u32,
    /// Re-entering the root after completing a word.
    pub transition: u32,
}

impl Default for MatchCosts {
    fn default() -> Self {
        Self {
            left: 1,
            diag: 1,
            down: 1,
            transition: 0,
        }
    }
}

impl MatchCosts {
    /// The cost set that works well for segmenting unspaced stories.
    pub fn boosted() -> Self {
        Self {
            left: 0x10,
            diag: 0x10,
            down: 0x10,
            transition: 0x8,
        }
    }
}

/// Beam width that pairs with [`MatchCosts::boosted`] for segmentation.
pub const BOOSTED_SEGMENTATION_BEAM: u32 = 0x50;

#[derive(Debug, Clone)]
struct TrieNode {
    /// `None` only for the root.
    value: Option<char>,
    /// `None` only for the root.
    parent: Option<usize>,
    /// `None` marks a leaf. Keyed by (is_leaf, character) so a word and a longer word sharing
    /// its prefix can coexist.
    children: Option<BTreeMap<(bool, char), usize>>,
}

impl TrieNode {
    fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// A word-end back-pointer: which leaf finished a word, and the word end before that.
#[derive(Debug, Clone, Copy)]
struct WordEnd {
    leaf: usize,
    prev: Option<usize>,
}

/// A character-indexed prefix tree with configurable match costs. Nodes live in an arena in
/// insertion order, which keeps every parent in front of its children — the column sweeps below
/// rely on that.
#[derive(Debug, Clone)]
pub struct Trie {
    nodes: Vec<TrieNode>,
    len: usize,
    pub costs: MatchCosts,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode {
                value: None,
                parent: None,
                children: Some(BTreeMap::new()),
            }],
            len: 0,
            costs: MatchCosts::default(),
        }
    }

    /// Number of words inserted.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a word, returning its leaf node index and whether it was new.
    pub fn insert(&mut self, word: &str) -> (usize, bool) {
        let chars: Vec<char> = word.chars().collect();
        assert!(!chars.is_empty(), "cannot insert an empty word");
        debug!("inserting `{word}`");

        let mut current = 0;
        let mut position = 0;
        // Follow existing internal nodes for as much of the prefix as possible.
        while position + 1 < chars.len() {
            let children = self.nodes[current]
                .children
                .as_ref()
                .expect("walk only visits non-leaf nodes");
            match children.get(&(false, chars[position])) {
                Some(&child) => {
                    current = child;
                    position += 1;
                }
                None => {
                    self.len += 1;
                    return (self.insert_chain(current, &chars[position..]), true);
                }
            }
        }

        let children = self.nodes[current]
            .children
            .as_ref()
            .expect("walk only visits non-leaf nodes");
        match children.get(&(true, chars[position])) {
            Some(&leaf) => (leaf, false),
            None => {
                self.len += 1;
                (self.insert_chain(current, &chars[position..]), true)
            }
        }
    }

    /// Append a fresh chain of internal nodes ending in a leaf for `suffix`.
    fn insert_chain(&mut self, mut parent: usize, suffix: &[char]) -> usize {
        for (i, &c) in suffix.iter().enumerate() {
            let is_last = i + 1 == suffix.len();
            let node = TrieNode {
                value: Some(c),
                parent: Some(parent),
                children: if is_last { None } else { Some(BTreeMap::new()) },
            };
            let index = self.nodes.len();
            self.nodes.push(node);
            let siblings = self.nodes[parent]
                .children
                .as_mut()
                .expect("chain parents are non-leaf");
            let previous = siblings.insert((is_last, c), index);
            assert!(previous.is_none(), "duplicate child ({is_last}, {c})");
            parent = index;
        }
        parent
    }

    /// The word spelled by the path from the root to `leaf`.
    fn word_at(&self, leaf: usize) -> String {
        let mut reversed = vec![];
        let mut current = Some(leaf);
        while let Some(index) = current {
            if let Some(value) = self.nodes[index].value {
                reversed.push(value);
            }
            current = self.nodes[index].parent;
        }
        reversed.iter().rev().collect()
    }

    /// Best-matching dictionary word for `word`, with its total edit cost. `None` when every
    /// complete word fell outside the beam.
    pub fn match_word_single(&self, word: &str, beam: u32) -> Option<(String, u32)> {
        let (losses, _, _) = self.match_columns(word, beam, false);
        let (leaf, loss) = self.best_leaf(&losses)?;
        Some((self.word_at(leaf), loss))
    }

    /// Best segmentation of `text` into dictionary words, with its total cost. Word boundaries
    /// each cost `transition`; everything else is edit cost against the concatenated words.
    pub fn match_words(&self, text: &str, beam: u32) -> Option<(Vec<String>, u32)> {
        let (losses, word_ends, arena) = self.match_columns(text, beam, true);
        let (leaf, loss) = self.best_leaf(&losses)?;
        let mut reversed = vec![self.word_at(leaf)];
        let mut current = word_ends[leaf];
        while let Some(index) = current {
            reversed.push(self.word_at(arena[index].leaf));
            current = arena[index].prev;
        }
        reversed.reverse();
        Some((reversed, loss))
    }

    /// Run the column sweep over the whole input, returning the final column, its word-end
    /// back-pointers and the back-pointer arena.
    fn match_columns(
        &self,
        text: &str,
        beam: u32,
        multi_word: bool,
    ) -> (Vec<u32>, Vec<Option<usize>>, Vec<WordEnd>) {
        assert!(!text.is_empty(), "cannot match an empty input");
        let n = self.nodes.len();
        let mut arena: Vec<WordEnd> = vec![];

        // Column 0: before any input, a node is reachable only by deleting its whole prefix.
        let mut losses = vec![INF; n];
        let mut word_ends: Vec<Option<usize>> = vec![None; n];
        losses[0] = 0;
        for index in 1..n {
            let parent = self.nodes[index].parent.expect("non-root has a parent");
            if losses[parent] != INF {
                losses[index] = losses[parent] + self.costs.down;
            }
        }
        self.prune(&mut losses, beam);

        for c in text.chars() {
            let mut new_losses = vec![INF; n];
            let mut new_word_ends: Vec<Option<usize>> = vec![None; n];

            for index in 0..n {
                let mut best = INF;
                let mut best_word_end = None;
                // Earliest candidate wins ties: left, then diag, then down.
                if losses[index] != INF {
                    best = losses[index] + self.costs.left;
                    best_word_end = word_ends[index];
                }
                if let Some(parent) = self.nodes[index].parent {
                    if losses[parent] != INF {
                        let step = if self.nodes[index].value == Some(c) {
                            0
                        } else {
                            self.costs.diag
                        };
                        let diag = losses[parent] + step;
                        if diag < best {
                            best = diag;
                            best_word_end = word_ends[parent];
                        }
                    }
                    // Parents precede children in the arena, so this column's parent entry is
                    // already settled.
                    if new_losses[parent] != INF {
                        let down = new_losses[parent] + self.costs.down;
                        if down < best {
                            best = down;
                            best_word_end = new_word_ends[parent];
                        }
                    }
                }
                new_losses[index] = best;
                new_word_ends[index] = best_word_end;
            }

            if multi_word {
                // Completed words re-enter the root within the same column; only the best entry
                // per column survives.
                for index in 1..n {
                    if self.nodes[index].is_leaf() && new_losses[index] != INF {
                        let candidate = new_losses[index] + self.costs.transition;
                        if candidate < new_losses[0] {
                            new_losses[0] = candidate;
                            arena.push(WordEnd {
                                leaf: index,
                                prev: new_word_ends[index],
                            });
                            new_word_ends[0] = Some(arena.len() - 1);
                        }
                    }
                }
            }

            self.prune(&mut new_losses, beam);
            losses = new_losses;
            word_ends = new_word_ends;
        }

        (losses, word_ends, arena)
    }

    /// Drop every entry further than `beam` above the column minimum.
    fn prune(&self, losses: &mut [u32], beam: u32) {
        let minimum = losses.iter().copied().min().unwrap_or(INF);
        if minimum == INF {
            return;
        }
        let threshold = minimum.saturating_add(beam);
        for loss in losses.iter_mut() {
            if *loss > threshold {
                *loss = INF;
            }
        }
    }

    /// The lowest-loss leaf in a column; earliest inserted wins ties.
    fn best_leaf(&self, losses: &[u32]) -> Option<(usize, u32)> {
        let mut best = None;
        for (index, node) in self.nodes.iter().enumerate() {
            if node.is_leaf() && losses[index] != INF {
                match best {
                    Some((_, loss)) if loss <= losses[index] => {}
                    _ => best = Some((index, losses[index])),
                }
            }
        }
        best
    }

    fn subtree_lines(&self, index: usize) -> Vec<String> {
        let value = self.nodes[index].value.map(String::from);
        let value = value.unwrap_or_else(|| "*".into());
        let children = match &self.nodes[index].children {
            Some(children) if !children.is_empty() => children,
            _ => return vec![value],
        };
        let mut subtrees: Vec<Vec<String>> =
            children.values().map(|&c| self.subtree_lines(c)).collect();
        subtrees.sort_by(|a, b| (a.len(), &a[0]).cmp(&(b.len(), &b[0])));

        let mut result = vec![format!("{value}─{}", subtrees[0][0])];
        result.extend(subtrees[0][1..].iter().map(|line| format!("│ {line}")));
        if subtrees.len() > 1 {
            for lines in &subtrees[1..subtrees.len() - 1] {
                result.push(format!("├─{}", lines[0]));
                result.extend(lines[1..].iter().map(|line| format!("│ {line}")));
            }
            let last = &subtrees[subtrees.len() - 1];
            result.push(format!("└─{}", last[0]));
            result.extend(last[1..].iter().map(|line| format!("  {line}")));
        }
        result
    }
}

impl fmt::Display for Trie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trie(len={}):", self.len)?;
        for line in self.subtree_lines(0) {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Load a dictionary file — one lowercase word per line, whitespace stripped, blank lines
/// ignored — into a trie.
pub fn dictionary_trie(path: impl AsRef<Path>) -> anyhow::Result<Trie> {
    let mut trie = Trie::new();
    for line in read_lines_stripped(&path)? {
        if !line.is_empty() {
            trie.insert(&line);
        }
    }
    Ok(trie)
}

/// Read a file as lines with surrounding whitespace stripped, preserving blank lines.
pub fn read_lines_stripped(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(content.lines().map(|line| line.trim().to_string()).collect())
}

static EDGE_PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[[:punct:]]+|[[:punct:]]+$").unwrap());

/// Read a file of whitespace-separated tokens, one line of words per input line. Tokens are
/// lowercased and stripped of surrounding punctuation so `"Hello,"` compares as `hello`.
pub fn read_word_lines(path: impl AsRef<Path>) -> anyhow::Result<Vec<Vec<String>>> {
    Ok(read_lines_stripped(path)?
        .iter()
        .map(|line| {
            line.split_whitespace()
                .map(|token| EDGE_PUNCTUATION.replace_all(token, "").to_lowercase())
                .filter(|token| !token.is_empty())
                .collect()
        })
        .collect())
}

/// Plain Levenshtein distance with unit costs.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for (i, row) in dp.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        dp[0][j] = j;
    }
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1]
            } else {
                dp[i - 1][j].min(dp[i][j - 1]).min(dp[i - 1][j - 1]) + 1
            };
        }
    }
    dp[a.len()][b.len()]
}

/// Edit distance between two word sequences, counting inserted, deleted and substituted words.
pub fn word_sequence_diff(a: &[String], b: &[String]) -> usize {
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for (i, row) in dp.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        dp[0][j] = j;
    }
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let node_loss = usize::from(a[i - 1] != b[j - 1]);
            dp[i][j] = (dp[i - 1][j] + 1)
                .min(dp[i][j - 1] + 1)
                .min(dp[i - 1][j - 1] + node_loss);
        }
    }
    dp[a.len()][b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Trie {
        let mut trie = Trie::new();
        for word in list {
            assert!(trie.insert(word).1);
        }
        trie
    }

    #[test]
    fn insert_reports_new_and_duplicate() {
        let mut trie = Trie::new();
        let (leaf, new) = trie.insert("bat");
        assert!(new);
        let (again, new) = trie.insert("bat");
        assert!(!new);
        assert_eq!(leaf, again);
        assert_eq!(trie.len(), 1);

        // A word and its extension coexist.
        assert!(trie.insert("battle").1);
        assert_eq!(trie.len(), 2);
    }

    #[test]
    #[should_panic]
    fn empty_insert_panics() {
        Trie::new().insert("");
    }

    #[test]
    fn display_draws_branches() {
        let trie = words(&["bat", "battle", "banana"]);
        let drawing = trie.to_string();
        assert!(drawing.contains("Trie(len=3)"));
        assert!(drawing.contains('─'));
    }

    #[test]
    fn exact_words_match_with_zero_loss_at_zero_beam() {
        let trie = words(&["bat", "battle", "banana", "and", "apple"]);
        for word in ["bat", "battle", "banana", "and", "apple"] {
            assert_eq!(
                trie.match_word_single(word, 0),
                Some((word.to_string(), 0)),
                "{word}"
            );
        }
    }

    #[test]
    fn spellcheck_prefers_single_deletion() {
        let trie = words(&["battle", "banana", "bat"]);
        assert_eq!(
            trie.match_word_single("batle", 3),
            Some(("battle".to_string(), 1))
        );
    }

    #[test]
    fn match_loss_equals_minimum_edit_distance() {
        let dictionary = ["battle", "banana", "bat", "apple", "and", "an", "a"];
        let trie = words(&dictionary);
        for input in ["batle", "bananna", "applw", "xyzzy", "ba", "anb"] {
            let expected = dictionary
                .iter()
                .map(|w| levenshtein_distance(input, w))
                .min()
                .unwrap() as u32;
            let (_, loss) = trie.match_word_single(input, 1000).unwrap();
            assert_eq!(loss, expected, "{input}");
        }
    }

    #[test]
    fn segmentation_recovers_word_sequence() {
        let trie = words(&["a", "an", "and", "apple"]);
        let (segmented, loss) = trie.match_words("anapple", 5).unwrap();
        assert_eq!(segmented, vec!["an".to_string(), "apple".to_string()]);
        assert_eq!(loss, 0);
    }

    #[test]
    fn segmentation_tolerates_typos() {
        let trie = words(&["a", "an", "and", "apple"]);
        // One substitution inside `apple`.
        let (segmented, loss) = trie.match_words("anapqle", 8).unwrap();
        assert_eq!(segmented, vec!["an".to_string(), "apple".to_string()]);
        assert_eq!(loss, 1);
    }

    #[test]
    fn boosted_costs_discourage_oversplitting() {
        let mut trie = words(&["at", "ten", "attend", "a"]);
        trie.costs = MatchCosts::boosted();
        let (segmented, _) = trie
            .match_words("attend", BOOSTED_SEGMENTATION_BEAM)
            .unwrap();
        assert_eq!(segmented, vec!["attend".to_string()]);
    }

    #[test]
    fn levenshtein_known_values() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("abc", "abc"), 0);
        assert_eq!(levenshtein_distance("abc", ""), 3);
    }

    #[test]
    fn word_sequence_diff_counts_word_edits() {
        let a: Vec<String> = ["an", "apple", "a", "day"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["an", "apples", "day"].iter().map(|s| s.to_string()).collect();
        assert_eq!(word_sequence_diff(&a, &b), 2);
        assert_eq!(word_sequence_diff(&a, &a), 0);
    }
}
