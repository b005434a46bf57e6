//! English and German stopword tables

use once_cell::sync::Lazy;
use std::collections::HashSet;

const ENGLISH: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves", "also", "may", "might", "must", "shall", "let", "us", "get", "got", "like",
    // conversational filler
    "hey", "hi", "hello", "thanks", "thank", "please", "yes", "yeah", "ok", "okay", "oh", "well",
    "really", "think", "thoughts", "im", "dont", "cant", "ive", "youre", "whats",
];

const GERMAN: &[&str] = &[
    "aber", "alle", "allem", "allen", "aller", "alles", "als", "also", "am", "an", "ander",
    "andere", "anderem", "anderen", "anderer", "anderes", "auch", "auf", "aus", "bei", "bin",
    "bis", "bist", "da", "damit", "dann", "das", "dass", "dein", "deine", "dem", "den", "denn",
    "der", "des", "dich", "die", "dies", "diese", "diesem", "diesen", "dieser", "dieses", "dir",
    "doch", "dort", "du", "durch", "ein", "eine", "einem", "einen", "einer", "eines", "er", "es",
    "etwas", "euch", "euer", "eure", "für", "gegen", "hab", "habe", "haben", "hat", "hatte",
    "hier", "hin", "ich", "ihm", "ihn", "ihnen", "ihr", "ihre", "im", "in", "indem", "ins", "ist",
    "ja", "jede", "jedem", "jeden", "jeder", "jedes", "kann", "kein", "keine", "können", "man",
    "manche", "mein", "meine", "mich", "mir", "mit", "muss", "nach", "nicht", "nichts", "noch",
    "nun", "nur", "ob", "oder", "ohne", "sehr", "sein", "seine", "sich", "sie", "sind", "so",
    "soll", "sollte", "sondern", "um", "und", "uns", "unser", "unter", "viel", "vom", "von",
    "vor", "war", "waren", "was", "weil", "welche", "wenn", "werde", "werden", "wie", "wieder",
    "will", "wir", "wird", "wo", "wollen", "zu", "zum", "zur", "zwar", "zwischen", "hallo",
    "danke", "bitte",
];

static STOPWORDS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ENGLISH.iter().chain(GERMAN.iter()).copied().collect());

/// Case-insensitive stopword check
pub fn is_stopword(word: &str) -> bool {
    if word.chars().any(char::is_uppercase) {
        STOPWORDS.contains(word.to_lowercase().as_str())
    } else {
        STOPWORDS.contains(word)
    }
}
