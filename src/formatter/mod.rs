pub struct Formatter {}

impl Formatter {
    pub fn format_size(size: usize, precision: u8) -> String {
        let mut size_float = size as f64;
        let mut size_unit = "B";

        for unit in ["KB", "MB", "GB", "TB"] {
            if size_float <= 1024.0 {
                break;
            }
            size_float /= 1024.0;
            size_unit = unit;
        }

        format!(
            "{number:.prec$} {unit}",
            number = size_float,
            prec = precision as usize,
            unit = size_unit
        )
    }
}
