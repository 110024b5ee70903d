mod caption;
pub use caption::Caption;

mod parse;
pub use parse::{ParseOptions, VttError, parse_vtt, validate_vtt_file};

mod serialize;
pub use serialize::{format_timestamp, to_vtt};
