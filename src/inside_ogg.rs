// Vorbis decoder written in Rust
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
Higher-level utilities for Ogg streams and files

This module provides higher level access to the library functionality,
built on top of the in-crate [`ogg_demux`](crate::ogg_demux) module.
*/

use crate::VorbisError;
use crate::header::*;
use std::io::Read;
use crate::audio::{PreviousWindowRight, read_audio_packet,
	read_audio_packet_generic, get_decoded_sample_count};
use crate::header::HeaderSet;
use crate::samples::{Samples, InterleavedSamples};
use crate::ogg_demux::{OggDemux, DemuxConfig, DemuxEvent, Packet, OggReadError};

/// Reads the three vorbis headers from an ogg demuxer as well as stream serial information
pub fn read_headers<R: Read>(demux: &mut OggDemux<R>) ->
		Result<(HeaderSet, u32), VorbisError> {
	let stream_serial = find_first_vorbis_stream(demux)?;
	let ident_packet = next_packet_for_serial(demux, stream_serial)?;
	let (headers, stream_serial, _stream_ends) =
		read_headers_with_ident_packet(demux, stream_serial, ident_packet)?;
	Ok((headers, stream_serial))
}

/// Drives the demuxer until a logical stream whose first packet is
/// identified as Vorbis appears, and returns its serial number.
fn find_first_vorbis_stream<R: Read>(demux: &mut OggDemux<R>) -> Result<u32, VorbisError> {
	loop {
		match demux.advance()? {
			DemuxEvent::NewStream { serial, codec: Some("vorbis") } => return Ok(serial),
			_ => continue,
		}
	}
}

fn read_headers_with_ident_packet<R: Read>(
	demux: &mut OggDemux<R>,
	stream_serial: u32,
	ident_packet: Packet,
) -> Result<(HeaderSet, u32, bool), VorbisError> {
	let pck: Packet = ident_packet;
	let ident_hdr = read_header_ident(&pck.data)?;

	let pck: Packet = next_packet_for_serial(demux, stream_serial)?;
	let comment_hdr = read_header_comment(&pck.data)?;

	let pck: Packet = next_packet_for_serial(demux, stream_serial)?;
	let setup_hdr = read_header_setup(&pck.data, ident_hdr.audio_channels,
		(ident_hdr.blocksize_0, ident_hdr.blocksize_1))?;

	Ok((
		(ident_hdr, comment_hdr, setup_hdr),
		pck.serial,
		pck.last_in_stream,
	))
}

/// Drives the demuxer, draining already-queued packets first, until a
/// packet for `stream_serial` becomes available.
fn next_packet_for_serial<R: Read>(
	demux: &mut OggDemux<R>, stream_serial: u32,
) -> Result<Packet, VorbisError> {
	loop {
		if let Some(pck) = demux.take_packet(stream_serial) {
			return Ok(pck);
		}
		match demux.advance() {
			Ok(_) => continue,
			Err(OggReadError::Eof) => return Err(VorbisError::OggError(OggReadError::Eof)),
			Err(e) => return Err(VorbisError::OggError(e)),
		}
	}
}

/**
Reading an ogg/vorbis stream

This is a small helper struct to help reading an ogg/vorbis stream in that format.

It only supports the main use case of unmultiplexed, pure audio ogg files streams.
Reading a file where vorbis is only one of multiplexed streams, like in the case of ogv, is not supported.
(Packets that do not belong to the stream are skipped by the underlying demuxer.)
If you need support for this, you need to use the lower level methods instead.

This struct only takes care of a single logical audio stream.
After reaching the end of a stream,
`read_dec_packet_*` functions do no longer return any audio,
even if there are another stream awaiting.
*/
pub struct OggStreamReader<T: Read> {
	demux: OggDemux<T>,
	pwr: PreviousWindowRight,

	stream_serial: u32,

	ident_hdr: IdentHeader,
	comment_hdr: CommentHeader,
	setup_hdr: SetupHeader,

	state: ReaderState,
	skip_count: u64,
	start_absgp: u64,
	cur_absgp: u64,

	next_packet: Option<Packet>,
}

enum ReaderState {
	Processing,
	Finished,
}

impl<T: Read> OggStreamReader<T> {
	/// Constructs a new OggStreamReader from a given implementation of `Read`.
	pub fn new(rdr: T) -> Result<Self, VorbisError> {
		Self::from_ogg_reader(OggDemux::new(rdr, DemuxConfig::default()))
	}

	/// Constructs a new OggStreamReader from a given Ogg demuxer.
	///
	/// The `new` function is a nice wrapper around this function that
	/// also creates the demuxer.
	pub fn from_ogg_reader(mut demux: OggDemux<T>) -> Result<Self, VorbisError> {
		let stream_serial = find_first_vorbis_stream(&mut demux)?;
		let ident_packet = next_packet_for_serial(&mut demux, stream_serial)?;
		Self::from_ogg_reader_and_previous_packet(demux, stream_serial, ident_packet)
	}

	fn from_ogg_reader_and_previous_packet(
		mut demux: OggDemux<T>,
		stream_serial: u32,
		ident_packet: Packet,
	) -> Result<Self, VorbisError> {
		let ((ident_hdr, comment_hdr, setup_hdr), stream_serial, no_more_packets) =
			read_headers_with_ident_packet(&mut demux, stream_serial, ident_packet)?;

		let mut reader = OggStreamReader {
			demux,
			pwr: PreviousWindowRight::new(),
			ident_hdr,
			comment_hdr,
			setup_hdr,
			stream_serial,
			// The following fields will be overwritten for normal initialization
			// (for streams with no less than two packets)
			state: ReaderState::Finished,
			skip_count: 0,
			start_absgp: 0,
			cur_absgp: 0,
			next_packet: None,
		};

		// If there are less than two audio packets, we cannot obtain any samples.
		if no_more_packets {
			// There are zero audio packets.
			return Ok(reader);
		}
		let first_packet = next_packet_for_serial(&mut reader.demux, stream_serial)?;
		if first_packet.last_in_stream {
			// There is one audio packet.
			return Ok(reader);
		}
		// Decode the first packet into pwr.
		read_audio_packet(&reader.ident_hdr, &reader.setup_hdr, &first_packet.data, &mut reader.pwr)?;
		// The second packet will actually be parsed later.
		reader.load_second_audio_packet()?;

		Ok(reader)
	}

	/// Read the second packet in a logical stream and adjust skip_count.
	/// The second packet must exist.
	fn load_second_audio_packet(&mut self) -> Result<(), VorbisError> {
		let second_packet = next_packet_for_serial(&mut self.demux, self.stream_serial)?;

		// The spec requires that the third audio packet will start in a fresh page,
		// and determine how many leading samples to drop.
		// However, some real-world ogg files does not seem to obey this.
		// In such case, we don't do such adjustment.
		if second_packet.last_in_page {
			let second_packet_sample_count =
				get_decoded_sample_count(&self.ident_hdr, &self.setup_hdr, &second_packet.data)? as u64;

			let skip_count = second_packet_sample_count.saturating_sub(second_packet.absgp);
			let start_absgp = second_packet.absgp.saturating_sub(second_packet_sample_count);
			assert_eq!(start_absgp + skip_count + second_packet_sample_count, second_packet.absgp);

			self.skip_count = skip_count;
			self.start_absgp = start_absgp;
			self.cur_absgp = start_absgp;
		}
		self.state = ReaderState::Processing;
		self.next_packet = Some(second_packet);

		Ok(())
	}

	/// Returns the wrapped demuxer, consuming the `OggStreamReader`.
	pub fn into_inner(self) -> OggDemux<T> {
		self.demux
	}

	/// Reads and decompresses an audio packet from the stream.
	///
	/// On read errors, it returns Err(e) with the error.
	///
	/// On success, it either returns None, when the end of the
	/// stream has been reached, or Some(packet_data),
	/// with the data of the decompressed packet.
	pub fn read_dec_packet(&mut self) ->
			Result<Option<Vec<Vec<i16>>>, VorbisError> {
		let pck = self.read_dec_packet_generic()?;
		Ok(pck)
	}

	/// Reads and decompresses an audio packet from the stream (generic).
	///
	/// On read errors, it returns Err(e) with the error.
	///
	/// On success, it either returns None, when the end of the
	/// stream has been reached, or Some(packet_data),
	/// with the data of the decompressed packet.
	pub fn read_dec_packet_generic<S: Samples>(&mut self) -> Result<Option<S>, VorbisError> {
		if let ReaderState::Finished = self.state {
			return Ok(None);
		}

		let pck = if let Some(next_packet) = self.next_packet.take() {
			next_packet
		} else {
			next_packet_for_serial(&mut self.demux, self.stream_serial)?
		};
		let mut decoded_pck: S = read_audio_packet_generic(
			&self.ident_hdr, &self.setup_hdr, &pck.data, &mut self.pwr)?;

		// The leading samples are skipped after parsing the second audio packet
		// for a logical stream.
		let skip_count = self.skip_count.min(decoded_pck.num_samples() as u64);
		self.skip_count -= skip_count;
		decoded_pck.truncate_begin(skip_count as usize);

		if pck.last_in_stream {
			if self.skip_count == 0 {
				// If this is the last packet in the logical bitstream,
				// we need to truncate it so that its ending matches the absgp of the current page.
				// This is what the spec mandates and also the behaviour of libvorbis.
				let truncate_size = (self.cur_absgp + decoded_pck.num_samples() as u64)
					.saturating_sub(pck.absgp);
				decoded_pck.truncate(truncate_size as usize);
			}

			self.state = ReaderState::Finished;
		}

		self.cur_absgp += decoded_pck.num_samples() as u64;
		if pck.last_in_page {
			if self.cur_absgp != pck.absgp {
				// It is not a good idea to panic here, since the input file is subject to corruption.
				self.cur_absgp = pck.absgp;
			}
		}

		Ok(Some(decoded_pck))
	}
	/// Reads and decompresses an audio packet from the stream (interleaved).
	///
	/// On read errors, it returns Err(e) with the error.
	///
	/// On success, it either returns None, when the end of the
	/// stream has been reached, or Some(packet_data),
	/// with the data of the decompressed packet.
	///
	/// Unlike `read_dec_packet`, this function returns the
	/// interleaved samples.
	pub fn read_dec_packet_itl(&mut self) ->
			Result<Option<Vec<i16>>, VorbisError> {
		let decoded_pck: InterleavedSamples<_> = match self.read_dec_packet_generic()? {
			Some(p) => p,
			None => return Ok(None),
		};
		Ok(Some(decoded_pck.samples))
	}

	/// Returns the stream serial of the current stream
	pub fn stream_serial(&self) -> u32 {
		self.stream_serial
	}

	pub fn start_absgp(&self) -> u64 {
		self.start_absgp
	}
	/// Returns the absolute granule position of the last read packet.
	///
	/// In the case of ogg/vorbis,
	/// the absolute granule position is given as number of PCM samples, on a per channel basis
	/// (that is, "a stereo stream's granule position does not increment at twice the speed of a mono stream").
	pub fn cur_absgp(&self) -> u64 {
		self.cur_absgp
	}

	pub fn ident_hdr(&self) -> &IdentHeader {
		&self.ident_hdr
	}

	pub fn comment_hdr(&self) -> &CommentHeader {
		&self.comment_hdr
	}

	pub fn setup_hdr(&self) -> &SetupHeader {
		&self.setup_hdr
	}
}
