//! Field framing for the wire protocol.
//!
//! Every message is a flat sequence of UTF-8 text fields, each followed by
//! the ASCII Unit Separator (0x1F):
//!
//! ```text
//! action \x1F param1 \x1F param2 \x1F
//! ```
//!
//! The first field is the action name; the remaining fields are its ordered
//! parameters. A message with no parameters is just `action \x1F`. The
//! separator is a non-printable control byte that user text must not contain
//! by contract — the codec does not enforce this. Beneath the field framing,
//! each message travels as one newline-terminated line on the stream (see
//! [`crate::channel`]).
//!
//! [`decode`] and [`encode`] are exact inverses for any fields that do not
//! contain the separator. The empty line decodes to a single empty field,
//! which the registry treats as a liveness ping.

/// Field separator: ASCII Unit Separator.
pub const SEP: char = '\u{1f}';

/// Encode an action and its parameters into one wire line.
///
/// Each field, the action included, is followed by [`SEP`]. The returned
/// line carries no trailing newline; the channel adds stream framing.
pub fn encode(action: &str, params: &[&str]) -> String {
    let mut line = String::with_capacity(
        action.len() + params.iter().map(|p| p.len() + 1).sum::<usize>() + 1,
    );
    line.push_str(action);
    line.push(SEP);
    for param in params {
        line.push_str(param);
        line.push(SEP);
    }
    line
}

/// Decode a wire line into its ordered fields.
///
/// The first field is the action name. The empty line yields a single
/// empty field.
pub fn decode(line: &str) -> Vec<String> {
    let body = line.strip_suffix(SEP).unwrap_or(line);
    body.split(SEP).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_terminates_every_field() {
        let line = encode("move", &["12", "-4"]);
        assert_eq!(line, "move\u{1f}12\u{1f}-4\u{1f}");
    }

    #[test]
    fn test_encode_without_params_still_terminated() {
        assert_eq!(encode("ping", &[]), "ping\u{1f}");
    }

    #[test]
    fn test_decode_inverts_encode() {
        let line = encode("spawn", &["alice", "3", ""]);
        assert_eq!(decode(&line), vec!["spawn", "alice", "3", ""]);
    }

    #[test]
    fn test_empty_line_decodes_to_single_empty_field() {
        assert_eq!(decode(""), vec![String::new()]);
    }

    #[test]
    fn test_decode_preserves_empty_params() {
        let line = encode("a", &["", "", "x"]);
        assert_eq!(decode(&line), vec!["a", "", "", "x"]);
    }

    #[test]
    fn test_round_trip_arbitrary_text() {
        let params = ["hello world", "line\nbreak", "unicode: ✓", "0"];
        let line = encode("chat", &params);
        let fields = decode(&line);
        assert_eq!(fields[0], "chat");
        assert_eq!(&fields[1..], &params);
    }
}
