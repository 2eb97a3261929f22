use glua_scanner::{scan, TokenKind};
use proptest::prelude::*;

proptest! {
    #[test]
    fn scanner_never_panics(input in "\\PC*") {
        // Arbitrary input produces tokens plus errors, never a panic.
        let _ = scan(&input);
    }

    #[test]
    fn stream_always_ends_with_eof(input in "\\PC*") {
        let (tokens, _) = scan(&input);
        prop_assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
    }

    #[test]
    fn lines_never_decrease(input in "\\PC*") {
        let (tokens, _) = scan(&input);
        for pair in tokens.windows(2) {
            prop_assert!(pair[0].line <= pair[1].line);
        }
    }
}
