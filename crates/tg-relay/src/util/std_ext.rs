use easy_ext::ext;

pub(crate) mod prelude {
    pub(crate) use super::ErrorExt as _;
    pub(crate) use super::IntoIteratorExt as _;
    pub(crate) use super::StrExt as _;
}

#[ext(ErrorExt)]
pub(crate) impl<E> E
where
    E: std::error::Error + ?Sized,
{
    fn display_chain(&self) -> display_error_chain::DisplayErrorChain<&Self> {
        display_error_chain::DisplayErrorChain::new(self)
    }
}

#[ext(IntoIteratorExt)]
pub(crate) impl<T: IntoIterator> T {
    fn map_collect<C, R>(self, map: impl FnMut(Self::Item) -> R) -> C
    where
        C: FromIterator<R>,
        Self: Sized,
    {
        self.into_iter().map(map).collect()
    }
}

#[ext(StrExt)]
pub(crate) impl str {
    /// Splits the string into pieces of at most `max_chars` characters each.
    /// Prefers to break at the last newline or whitespace inside the window
    /// so that words are not cut in half.
    fn chunks_by_chars(&self, max_chars: usize) -> Vec<&str> {
        let mut chunks = vec![];
        let mut rest = self;

        while rest.chars().count() > max_chars {
            let window_end = rest
                .char_indices()
                .nth(max_chars)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());

            let window = &rest[..window_end];

            let split_at = window
                .rfind('\n')
                .or_else(|| window.rfind(char::is_whitespace))
                .filter(|&i| i > 0)
                .unwrap_or(window_end);

            let (chunk, tail) = rest.split_at(split_at);
            chunks.push(chunk);
            rest = tail.trim_start();
        }

        if !rest.is_empty() {
            chunks.push(rest);
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::StrExt;

    #[test]
    fn chunks_short_text_is_untouched() {
        assert_eq!("hello".chunks_by_chars(10), vec!["hello"]);
        assert!("".chunks_by_chars(10).is_empty());
    }

    #[test]
    fn chunks_break_on_whitespace() {
        let chunks = "aaaa bbbb cccc".chunks_by_chars(9);
        assert_eq!(chunks, vec!["aaaa", "bbbb cccc"]);
    }

    #[test]
    fn chunks_count_chars_not_bytes() {
        let text = "привет".repeat(3);
        let chunks = text.chunks_by_chars(6);
        assert_eq!(chunks, vec!["привет", "привет", "привет"]);
    }
}
