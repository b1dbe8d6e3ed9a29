//! Поиск стоп-последовательностей в потоке фрагментов.
//!
//! Стоп-строка может прийти разрезанной на несколько токенов, поэтому поиск идёт
//! по накопленному тексту, но только в хвостовом окне.

/// Решение по очередному фрагменту.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCheck {
    /// Совпадения нет, фрагмент отдаётся целиком.
    Continue,
    /// Найдена стоп-строка. `forward`: часть фрагмента до неё (может быть пустой).
    Matched { forward: String },
}

#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    max_len: usize,
    buffer: String,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        let stops: Vec<String> = stops.iter().filter(|s| !s.is_empty()).cloned().collect();
        let max_len = stops.iter().map(String::len).max().unwrap_or(0);
        Self {
            stops,
            max_len,
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, piece: &str) -> StopCheck {
        let piece_start = self.buffer.len();
        self.buffer.push_str(piece);
        if self.stops.is_empty() {
            return StopCheck::Continue;
        }

        let mut window = piece_start.saturating_sub(self.max_len.saturating_sub(1));
        while !self.buffer.is_char_boundary(window) {
            window -= 1;
        }
        let tail = &self.buffer[window..];

        let earliest = self
            .stops
            .iter()
            .filter_map(|stop| tail.find(stop.as_str()))
            .min();

        match earliest {
            Some(offset) => {
                let at = window + offset;
                let forward = if at > piece_start {
                    self.buffer[piece_start..at].to_string()
                } else {
                    String::new()
                };
                StopCheck::Matched { forward }
            }
            None => StopCheck::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_stops_passes_everything() {
        let mut m = StopMatcher::new(&[]);
        assert_eq!(m.push("hello"), StopCheck::Continue);
        assert_eq!(m.push(" world"), StopCheck::Continue);
    }

    #[test]
    fn test_empty_stop_ignored() {
        let mut m = StopMatcher::new(&stops(&["", "</s>"]));
        assert_eq!(m.push("abc"), StopCheck::Continue);
    }

    #[test]
    fn test_stop_inside_fragment_forwards_prefix() {
        let mut m = StopMatcher::new(&stops(&["<|im_end|>"]));
        assert_eq!(m.push("Hi"), StopCheck::Continue);
        assert_eq!(
            m.push(" there<|im_end|>junk"),
            StopCheck::Matched {
                forward: " there".into()
            }
        );
    }

    #[test]
    fn test_stop_split_across_fragments() {
        let mut m = StopMatcher::new(&stops(&["<|end|>"]));
        assert_eq!(m.push("ok<|e"), StopCheck::Continue);
        assert_eq!(m.push("nd"), StopCheck::Continue);
        // Начало стоп-строки уже ушло наружу, из текущего фрагмента нечего отдавать.
        assert_eq!(
            m.push("|>"),
            StopCheck::Matched {
                forward: String::new()
            }
        );
    }

    #[test]
    fn test_earliest_match_wins() {
        let mut m = StopMatcher::new(&stops(&["[INST]", "</s>"]));
        assert_eq!(
            m.push("a</s>b[INST]"),
            StopCheck::Matched { forward: "a".into() }
        );
    }

    #[test]
    fn test_window_respects_char_boundaries() {
        let mut m = StopMatcher::new(&stops(&["<|end|>"]));
        assert_eq!(m.push("привет"), StopCheck::Continue);
        assert_eq!(m.push("ж"), StopCheck::Continue);
        assert_eq!(
            m.push("ёж<|end|>"),
            StopCheck::Matched {
                forward: "ёж".into()
            }
        );
    }
}
