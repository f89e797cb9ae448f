//! Thin safe wrappers over libavcodec surfaces that `ffmpeg-next` does not
//! expose: bitstream filters, codec-parameter fields, and per-stream seeks.

use std::ffi::{CStr, CString};
use std::ptr;

use crate::ffmpeg;
use ffmpeg::codec::Parameters;
use ffmpeg::ffi;
use ffmpeg::format::context::Input;
use ffmpeg::packet::Mut as _;
use ffmpeg::Packet;

/// An initialized bitstream filter (`h264_mp4toannexb`, `hevc_mp4toannexb`,
/// `dump_extra`, ...) bound to a source stream's codec parameters.
pub struct BitstreamFilter {
	ptr: *mut ffi::AVBSFContext,
}

impl BitstreamFilter {
	/// Look up `name` and initialize it with the given input parameters and
	/// time base.
	pub fn new(name: &str, params: &Parameters, time_base: ffmpeg::Rational) -> Result<Self, ffmpeg::Error> {
		let c_name = CString::new(name).map_err(|_| ffmpeg::Error::InvalidData)?;
		unsafe {
			let filter = ffi::av_bsf_get_by_name(c_name.as_ptr());
			if filter.is_null() {
				return Err(ffmpeg::Error::BsfNotFound);
			}

			let mut ptr = ptr::null_mut();
			err(ffi::av_bsf_alloc(filter, &mut ptr))?;

			err(ffi::avcodec_parameters_copy((*ptr).par_in, params.as_ptr())).inspect_err(|_| {
				ffi::av_bsf_free(&mut ptr);
			})?;
			(*ptr).time_base_in = time_base.into();

			err(ffi::av_bsf_init(ptr)).inspect_err(|_| {
				ffi::av_bsf_free(&mut ptr);
			})?;

			Ok(Self { ptr })
		}
	}

	/// Push a packet through the filter, or flush with `None`, and collect
	/// everything it produces.
	pub fn filter(&mut self, packet: Option<&Packet>) -> Result<Vec<Packet>, ffmpeg::Error> {
		unsafe {
			match packet {
				Some(packet) => {
					// av_bsf_send_packet takes ownership of the reference,
					// so feed it a clone and let the emptied shell drop.
					let mut owned = packet.clone();
					err(ffi::av_bsf_send_packet(self.ptr, owned.as_mut_ptr()))?;
				}
				None => err(ffi::av_bsf_send_packet(self.ptr, ptr::null_mut()))?,
			}

			let mut out = Vec::new();
			loop {
				let mut filtered = Packet::empty();
				// Nonzero here is EAGAIN (needs more input) or EOF.
				if ffi::av_bsf_receive_packet(self.ptr, filtered.as_mut_ptr()) != 0 {
					break;
				}
				out.push(filtered);
			}
			Ok(out)
		}
	}

	/// Reset internal state, e.g. after a seek on the source.
	pub fn flush(&mut self) {
		unsafe { ffi::av_bsf_flush(self.ptr) }
	}
}

impl Drop for BitstreamFilter {
	fn drop(&mut self) {
		unsafe { ffi::av_bsf_free(&mut self.ptr) }
	}
}

// The context is owned and never aliased.
unsafe impl Send for BitstreamFilter {}

/// The codec extradata carried by a stream's parameters, if any.
pub fn extradata(params: &Parameters) -> Option<&[u8]> {
	unsafe {
		let par = params.as_ptr();
		if (*par).extradata.is_null() || (*par).extradata_size <= 0 {
			return None;
		}
		Some(std::slice::from_raw_parts((*par).extradata, (*par).extradata_size as usize))
	}
}

/// The fourcc codec tag carried by a stream's parameters.
pub fn codec_tag(params: &Parameters) -> u32 {
	unsafe { (*params.as_ptr()).codec_tag }
}

/// Overwrite the codec tag on an output stream.
pub fn set_stream_codec_tag(stream: &mut ffmpeg::StreamMut, tag: u32) {
	unsafe {
		(*(*stream.as_mut_ptr()).codecpar).codec_tag = tag;
	}
}

/// Overwrite the disposition flags (default, forced, hearing-impaired, ...)
/// on an output stream.
pub fn set_stream_disposition(stream: &mut ffmpeg::StreamMut, disposition: i32) {
	unsafe {
		(*stream.as_mut_ptr()).disposition = disposition;
	}
}

/// Snapshot a codec context's parameters, e.g. to publish an opened
/// encoder's extradata and codec id onto an output stream.
pub fn context_parameters(context: &ffmpeg::codec::context::Context) -> Result<Parameters, ffmpeg::Error> {
	let mut params = Parameters::new();
	unsafe {
		err(ffi::avcodec_parameters_from_context(params.as_mut_ptr(), context.as_ptr()))?;
	}
	Ok(params)
}

/// Replace the metadata dictionary on an output stream.
pub fn set_stream_metadata(stream: &mut ffmpeg::StreamMut, pairs: &[(String, String)]) {
	unsafe {
		let metadata = &mut (*stream.as_mut_ptr()).metadata;
		for (key, value) in pairs {
			let (Ok(key), Ok(value)) = (CString::new(key.as_str()), CString::new(value.as_str())) else {
				continue;
			};
			ffi::av_dict_set(metadata, key.as_ptr(), value.as_ptr(), 0);
		}
	}
}

/// The human-readable profile name ("High", "Main 10", ...) for a stream's
/// parameters, as libavcodec reports it.
pub fn profile_name(params: &Parameters) -> Option<String> {
	unsafe {
		let par = params.as_ptr();
		let name = ffi::avcodec_profile_name((*par).codec_id, (*par).profile);
		if name.is_null() {
			return None;
		}
		Some(CStr::from_ptr(name).to_string_lossy().into_owned())
	}
}

/// The bit rate recorded in a stream's parameters, when known.
pub fn bit_rate(params: &Parameters) -> Option<i64> {
	unsafe {
		let rate = (*params.as_ptr()).bit_rate;
		(rate > 0).then_some(rate)
	}
}

/// Coded dimensions from a stream's parameters.
pub fn video_dimensions(params: &Parameters) -> (u32, u32) {
	unsafe {
		let par = params.as_ptr();
		((*par).width.max(0) as u32, (*par).height.max(0) as u32)
	}
}

/// Pixel format from a stream's parameters.
pub fn pixel_format(params: &Parameters) -> ffmpeg::format::Pixel {
	unsafe {
		let format: ffi::AVPixelFormat = std::mem::transmute((*params.as_ptr()).format);
		ffmpeg::format::Pixel::from(format)
	}
}

/// Sample aspect ratio from a stream's parameters.
pub fn sample_aspect_ratio(params: &Parameters) -> ffmpeg::Rational {
	unsafe { ffmpeg::Rational::from((*params.as_ptr()).sample_aspect_ratio) }
}

/// The container-level start time in `AV_TIME_BASE` units, when known.
pub fn container_start_time(input: &Input) -> Option<i64> {
	unsafe {
		let start = (*input.as_ptr()).start_time;
		(start != ffi::AV_NOPTS_VALUE).then_some(start)
	}
}

/// The container-level duration in `AV_TIME_BASE` units, when known.
pub fn container_duration(input: &Input) -> Option<i64> {
	unsafe {
		let duration = (*input.as_ptr()).duration;
		(duration != ffi::AV_NOPTS_VALUE && duration > 0).then_some(duration)
	}
}

/// Seek `input` so that the next demuxed packet for `stream_index` lands at
/// or before `ts` (in that stream's time base).
pub fn seek_stream(input: &mut Input, stream_index: usize, ts: i64) -> Result<(), ffmpeg::Error> {
	unsafe {
		err(ffi::av_seek_frame(
			input.as_mut_ptr(),
			stream_index as i32,
			ts,
			ffi::AVSEEK_FLAG_BACKWARD,
		))?;
	}
	Ok(())
}

fn err(ret: std::os::raw::c_int) -> Result<(), ffmpeg::Error> {
	if ret < 0 {
		return Err(ffmpeg::Error::from(ret));
	}
	Ok(())
}
