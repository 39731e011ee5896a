use std::ascii;

/// Escapes arbitrary bytes into a printable string for log output.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    String::from_utf8(
        input
            .iter()
            .flat_map(|&c| ascii::escape_default(c))
            .collect::<Vec<u8>>(),
    )
    .unwrap_or_default()
}
