//! Bitstream-level NAL unit classification for H.264 and H.265.
//!
//! The demuxer's keyframe flag is over-inclusive: it also marks packets that
//! only carry parameter sets (VPS/SPS/PPS) with no picture payload, and
//! codec-private recovery points that are not usable cut entries. The index
//! therefore classifies each candidate packet by walking its raw payload,
//! in either MP4 length-prefixed (AVCC/HVCC) or Annex-B form, and reducing
//! the NAL units found to a single representative type.

/// ITU-T H.264 Table 7-1 NAL unit type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum H264NalType {
	SliceNonIdr = 1,
	SlicePartitionA = 2,
	SlicePartitionB = 3,
	SlicePartitionC = 4,
	SliceIdr = 5,
	Sei = 6,
	Sps = 7,
	Pps = 8,
	Aud = 9,
	EndOfSequence = 10,
	EndOfStream = 11,
	Filler = 12,
	SpsExt = 13,
	Prefix = 14,
	SubsetSps = 15,
}

/// ITU-T H.265 Table 7-1 NAL unit type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum HevcNalType {
	TrailN = 0,
	TrailR = 1,
	TsaN = 2,
	TsaR = 3,
	StsaN = 4,
	StsaR = 5,
	RadlN = 6,
	RadlR = 7,
	RaslN = 8,
	RaslR = 9,
	// 10 -> 15 reserved
	BlaWLp = 16,
	BlaWRadl = 17,
	BlaNLp = 18,
	IdrWRadl = 19,
	IdrNLp = 20,
	Cra = 21,
	// 22 -> 31 reserved
	Vps = 32,
	Sps = 33,
	Pps = 34,
	Aud = 35,
	EndOfSequence = 36,
	EndOfBitstream = 37,
	Filler = 38,
	SeiPrefix = 39,
	SeiSuffix = 40,
}

/// Extract the representative NAL unit type from an H.264 packet payload.
///
/// A packet may carry several NAL units; the first IDR (5) found anywhere
/// wins, else the first slice in 1..=4, else the first NAL encountered
/// (parameter sets, SEI, AUD).
pub fn h264_nal_unit_type(data: &[u8]) -> Option<u8> {
	if data.len() < 5 {
		return None;
	}

	let found = match scan_nal_types(data, 1, |b| b & 0x1F, |t| t == H264NalType::SliceIdr as u8) {
		Scan::Priority(t) => return Some(t),
		Scan::All(found) => found,
	};

	// No IDR found: prefer picture slices over metadata.
	for &t in &found {
		if (1..=4).contains(&t) {
			return Some(t);
		}
	}
	found.first().copied()
}

/// Extract the representative NAL unit type from an H.265 packet payload.
///
/// The first BLA/IDR (16..=20) found anywhere wins, else the first CRA (21),
/// else the first picture NAL (0..=15), else the first metadata NAL.
pub fn h265_nal_unit_type(data: &[u8]) -> Option<u8> {
	if data.len() < 6 {
		return None;
	}

	let found = match scan_nal_types(data, 2, |b| (b >> 1) & 0x3F, |t| (16..=20).contains(&t)) {
		Scan::Priority(t) => return Some(t),
		Scan::All(found) => found,
	};

	// No BLA/IDR found: CRA needs special handling but is still a picture.
	for &t in &found {
		if t == HevcNalType::Cra as u8 {
			return Some(t);
		}
	}
	for &t in &found {
		if t <= 15 {
			return Some(t);
		}
	}
	found.first().copied()
}

/// Whether an H.264 NAL type marks a keyframe that is safe to cut at.
///
/// IDR (5), SEI (6) and parameter sets (7, 8) are accepted. An unknown type
/// is assumed safe; there is nothing better to go on.
pub fn is_safe_h264_keyframe(nal: Option<u8>) -> bool {
	match nal {
		None => true,
		Some(t) => (5..=8).contains(&t),
	}
}

/// Whether an H.265 NAL type marks a keyframe that is safe to cut at.
///
/// BLA (16..=18), IDR (19, 20), CRA (21) and parameter sets (32..=34) are
/// accepted. An unknown type is assumed safe.
pub fn is_safe_h265_keyframe(nal: Option<u8>) -> bool {
	match nal {
		None => true,
		Some(t) => matches!(t, 16..=21 | 32..=34),
	}
}

/// RASL pictures reference frames from before the associated CRA and become
/// undecodable when those frames are cut away.
pub fn is_rasl(nal: Option<u8>) -> bool {
	matches!(nal, Some(t) if t == HevcNalType::RaslN as u8 || t == HevcNalType::RaslR as u8)
}

/// RADL pictures are leading pictures that do not reference anything before
/// the associated IRAP.
pub fn is_radl(nal: Option<u8>) -> bool {
	matches!(nal, Some(t) if t == HevcNalType::RadlN as u8 || t == HevcNalType::RadlR as u8)
}

/// Leading pictures (RASL or RADL) are displayed before the IRAP in
/// presentation order but decoded after it. When an IRAP with RASL pictures
/// opens the output, all of its leading pictures are recoded together; they
/// are interleaved in presentation order and cannot be split cleanly.
pub fn is_leading_picture(nal: Option<u8>) -> bool {
	is_rasl(nal) || is_radl(nal)
}

enum Scan {
	/// A priority type was found; scanning stopped early.
	Priority(u8),
	All(Vec<u8>),
}

/// Walk every NAL unit in the payload, in either length-prefixed or Annex-B
/// form, extracting the type from the first header byte. Stops early when
/// `priority` matches.
///
/// `header_len` is the number of header bytes that must follow a start code
/// or length prefix for the type to be readable (1 for H.264, 2 for H.265).
fn scan_nal_types(data: &[u8], header_len: usize, extract: impl Fn(u8) -> u8, priority: impl Fn(u8) -> bool) -> Scan {
	// Try the MP4 length-prefixed form first: a big-endian u32 length at
	// offset 0. Annex-B start codes read as lengths 0 or 1, so requiring
	// `4 < length <= len - 4` cannot misfire on them.
	let first_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
	if first_len > 4 && first_len <= data.len() - 4 {
		let mut found = Vec::new();
		let mut i = 0;
		while i + 4 < data.len() {
			let nal_len = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
			if nal_len < header_len || nal_len > data.len() - i - 4 {
				break; // invalid length record
			}
			if i + 4 + header_len <= data.len() {
				let t = extract(data[i + 4]);
				if priority(t) {
					return Scan::Priority(t);
				}
				found.push(t);
			}
			i += 4 + nal_len;
		}
		if !found.is_empty() {
			return Scan::All(found);
		}
	}

	// Fall back to Annex-B start codes, preferring `00 00 00 01` when both
	// forms coincide at the same offset.
	let mut found = Vec::new();
	let mut pos = 0;
	while pos + 3 + header_len < data.len() {
		let idx4 = find(data, pos, &[0, 0, 0, 1]);
		let idx3 = find(data, pos, &[0, 0, 1]);

		let (idx, code_len) = match (idx4, idx3) {
			(None, None) => break,
			(Some(i4), None) => (i4, 4),
			(None, Some(i3)) => (i3, 3),
			(Some(i4), Some(i3)) if i4 <= i3 => (i4, 4),
			(_, Some(i3)) => (i3, 3),
		};

		if idx + code_len + header_len <= data.len() {
			let t = extract(data[idx + code_len]);
			if priority(t) {
				return Scan::Priority(t);
			}
			found.push(t);
		}
		pos = idx + code_len;
	}

	Scan::All(found)
}

fn find(data: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
	if from >= data.len() {
		return None;
	}
	data[from..].windows(needle.len()).position(|w| w == needle).map(|i| i + from)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn avcc(units: &[&[u8]]) -> Vec<u8> {
		let mut out = Vec::new();
		for unit in units {
			out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
			out.extend_from_slice(unit);
		}
		out
	}

	fn annexb(units: &[&[u8]]) -> Vec<u8> {
		let mut out = Vec::new();
		for unit in units {
			out.extend_from_slice(&[0, 0, 0, 1]);
			out.extend_from_slice(unit);
		}
		out
	}

	fn h264_unit(nal_type: u8, len: usize) -> Vec<u8> {
		let mut unit = vec![0u8; len];
		unit[0] = nal_type & 0x1F;
		unit
	}

	fn h265_unit(nal_type: u8, len: usize) -> Vec<u8> {
		let mut unit = vec![0u8; len];
		unit[0] = (nal_type & 0x3F) << 1;
		unit
	}

	#[test]
	fn test_h264_idr_wins_over_earlier_metadata() {
		let data = avcc(&[&h264_unit(7, 8), &h264_unit(8, 6), &h264_unit(5, 32)]);
		assert_eq!(h264_nal_unit_type(&data), Some(5));
	}

	#[test]
	fn test_h264_slice_preferred_over_sei() {
		let data = avcc(&[&h264_unit(6, 8), &h264_unit(1, 32)]);
		assert_eq!(h264_nal_unit_type(&data), Some(1));
	}

	#[test]
	fn test_h264_parameter_sets_only() {
		let data = avcc(&[&h264_unit(7, 8), &h264_unit(8, 6)]);
		assert_eq!(h264_nal_unit_type(&data), Some(7));
	}

	#[test]
	fn test_h264_annexb_form() {
		let data = annexb(&[&h264_unit(9, 5), &h264_unit(5, 16)]);
		assert_eq!(h264_nal_unit_type(&data), Some(5));
	}

	#[test]
	fn test_h264_three_byte_start_code() {
		let mut data = vec![0, 0, 1];
		data.extend_from_slice(&h264_unit(1, 16));
		assert_eq!(h264_nal_unit_type(&data), Some(1));
	}

	#[test]
	fn test_h264_too_short() {
		assert_eq!(h264_nal_unit_type(&[0, 0, 0, 1]), None);
		assert_eq!(h264_nal_unit_type(&[]), None);
	}

	#[test]
	fn test_h265_idr_wins() {
		let data = avcc(&[&h265_unit(32, 8), &h265_unit(33, 8), &h265_unit(19, 32)]);
		assert_eq!(h265_nal_unit_type(&data), Some(19));
	}

	#[test]
	fn test_h265_cra_preferred_over_trailing() {
		let data = avcc(&[&h265_unit(0, 16), &h265_unit(21, 32)]);
		assert_eq!(h265_nal_unit_type(&data), Some(21));
	}

	#[test]
	fn test_h265_picture_preferred_over_parameter_sets() {
		let data = annexb(&[&h265_unit(33, 8), &h265_unit(34, 6), &h265_unit(1, 32)]);
		assert_eq!(h265_nal_unit_type(&data), Some(1));
	}

	#[test]
	fn test_h265_parameter_sets_only() {
		let data = avcc(&[&h265_unit(32, 8), &h265_unit(33, 8), &h265_unit(34, 6)]);
		assert_eq!(h265_nal_unit_type(&data), Some(32));
	}

	#[test]
	fn test_length_prefix_not_confused_with_start_code() {
		// An Annex-B payload whose first four bytes are a start code must not
		// be parsed as a length record.
		let data = annexb(&[&h265_unit(19, 32)]);
		assert_eq!(h265_nal_unit_type(&data), Some(19));
	}

	#[test]
	fn test_invalid_length_record_falls_back() {
		// Claims a NAL longer than the payload.
		let mut data = vec![0, 0, 255, 255];
		data.extend_from_slice(&h264_unit(5, 16));
		assert_eq!(h264_nal_unit_type(&data), None);
	}

	#[test]
	fn test_safe_keyframe_predicates() {
		assert!(is_safe_h264_keyframe(Some(5)));
		assert!(is_safe_h264_keyframe(Some(7)));
		assert!(!is_safe_h264_keyframe(Some(1)));
		assert!(is_safe_h264_keyframe(None));

		assert!(is_safe_h265_keyframe(Some(16)));
		assert!(is_safe_h265_keyframe(Some(21)));
		assert!(is_safe_h265_keyframe(Some(34)));
		assert!(!is_safe_h265_keyframe(Some(0)));
		assert!(!is_safe_h265_keyframe(Some(8)));
		assert!(is_safe_h265_keyframe(None));
	}

	#[test]
	fn test_leading_picture_predicates() {
		assert!(is_rasl(Some(8)));
		assert!(is_rasl(Some(9)));
		assert!(!is_rasl(Some(6)));
		assert!(!is_rasl(None));

		assert!(is_radl(Some(6)));
		assert!(is_radl(Some(7)));
		assert!(!is_radl(Some(9)));

		assert!(is_leading_picture(Some(6)));
		assert!(is_leading_picture(Some(9)));
		assert!(!is_leading_picture(Some(21)));
	}

	#[test]
	fn test_enum_round_trip() {
		assert_eq!(HevcNalType::try_from(21), Ok(HevcNalType::Cra));
		assert_eq!(H264NalType::try_from(5), Ok(H264NalType::SliceIdr));
		assert!(HevcNalType::try_from(25).is_err());
	}
}
