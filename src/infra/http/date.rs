//! IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`) as used by `Last-Modified` and
//! `If-Modified-Since`.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const IMF_FIXDATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub fn format_http_date(value: OffsetDateTime) -> Option<String> {
    value.to_offset(UtcOffset::UTC).format(IMF_FIXDATE).ok()
}

/// Parse an IMF-fixdate. Obsolete formats are treated as absent.
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), IMF_FIXDATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}
