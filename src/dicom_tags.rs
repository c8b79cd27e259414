//! Helpers for parsing a `"gggg,eeee"` tag reference from configuration and reading that tag's
//! value back out of a stored DICOM file (§4.5 grouping rule).
use crate::error::{GroupingError, ProcessorConfigError};
use camino::Utf8Path;
use dicom::core::Tag;
use dicom::dictionary_std::tags;

/// Parses a tag reference of the form `"gggg,eeee"` (hex group/element), or one of the handful
/// of symbolic names the default configuration uses (§4.5: `groupBy` default is
/// `StudyInstanceUID`).
pub fn parse_tag_ref(raw: &str) -> Result<Tag, ProcessorConfigError> {
    match raw {
        "StudyInstanceUID" => return Ok(tags::STUDY_INSTANCE_UID),
        "SeriesInstanceUID" => return Ok(tags::SERIES_INSTANCE_UID),
        "PatientID" => return Ok(tags::PATIENT_ID),
        _ => {}
    }
    let (group, element) = raw
        .split_once(',')
        .ok_or_else(|| ProcessorConfigError::InvalidGroupBy(raw.to_string()))?;
    let group = u16::from_str_radix(group.trim(), 16)
        .map_err(|_| ProcessorConfigError::InvalidGroupBy(raw.to_string()))?;
    let element = u16::from_str_radix(element.trim(), 16)
        .map_err(|_| ProcessorConfigError::InvalidGroupBy(raw.to_string()))?;
    Ok(Tag(group, element))
}

/// Opens the DICOM file at `path` and reads `tag`'s value as a trimmed string. Returns
/// [`GroupingError::MissingGroupingTag`] if the tag is absent or empty (§4.5: "If absent or
/// empty, log at error and drop the event").
pub fn read_tag_value(
    path: &Utf8Path,
    tag: Tag,
    sop_instance_uid: &str,
) -> Result<String, GroupingError> {
    let missing = || GroupingError::MissingGroupingTag {
        tag: format!("{:04X},{:04X}", tag.0, tag.1),
        sop_instance_uid: sop_instance_uid.to_string(),
    };
    let obj = dicom::object::open_file(path.as_std_path()).map_err(|_| missing())?;
    let element = obj.element(tag).map_err(|_| missing())?;
    let value = element.string().map_err(|_| missing())?.trim().to_string();
    if value.is_empty() {
        return Err(missing());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symbolic_default() {
        assert_eq!(parse_tag_ref("StudyInstanceUID").unwrap(), tags::STUDY_INSTANCE_UID);
    }

    #[test]
    fn parses_hex_pair() {
        assert_eq!(parse_tag_ref("0020,000d").unwrap(), tags::STUDY_INSTANCE_UID);
    }

    #[test]
    fn rejects_malformed_reference() {
        assert!(parse_tag_ref("not-a-tag").is_err());
        assert!(parse_tag_ref("zzzz,eeee").is_err());
    }
}
