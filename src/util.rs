pub fn format_size<T>(value: T) -> humansize::SizeFormatter<T, humansize::FormatSizeOptions>
where
    T: humansize::ToF64 + humansize::Unsigned,
{
    humansize::SizeFormatter::new(value, humansize::BINARY)
}

/// Rounds a non-negative physical length to whole cells.
pub fn round_to_cells(length: f64, spacing: f64) -> usize {
    (length / spacing).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::round_to_cells;

    #[test]
    fn rounds_lengths_to_cells() {
        assert_eq!(round_to_cells(0.0149, 0.001), 15);
        assert_eq!(round_to_cells(0.0, 0.001), 0);
    }
}
