//! Binary session images.
//!
//! Layout: `MAGIC` (8 bytes), `u32` version, then a sequence of chunks
//! `tag[4] | len u32 | uncompressed_len u32 | lz4 payload`. Readers skip tags
//! they do not know. Float arrays are stored as raw little-endian bits so a
//! round trip is exact.

use std::io::{self, Read, Write};

use crate::tensor::Tensor;

pub const MAGIC: &[u8; 8] = b"NMFIT001";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

/// A sink that only counts bytes; used to size an image without building it.
#[derive(Debug, Default)]
pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn len_u32(n: usize) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| invalid("length does not fit in u32"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_len<W: Write>(w: &mut W, n: usize) -> io::Result<()> {
    write_u32_le(w, len_u32(n)?)
}

pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_len(w, bytes.len())?;
    w.write_all(bytes)
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

/// Length-prefixed `f32` array.
pub fn write_f32_slice<W: Write>(w: &mut W, v: &[f32]) -> io::Result<()> {
    write_len(w, v.len())?;
    for &x in v {
        write_f32_le(w, x)?;
    }
    Ok(())
}

/// Length-prefixed list of `f32` arrays.
pub fn write_f32_rows<W: Write>(w: &mut W, rows: &[Vec<f32>]) -> io::Result<()> {
    write_len(w, rows.len())?;
    rows.iter().try_for_each(|r| write_f32_slice(w, r))
}

pub fn write_tensor<W: Write>(w: &mut W, t: &Tensor) -> io::Result<()> {
    write_len(w, t.shape.len())?;
    for &d in &t.shape {
        write_u64_le(w, d as u64)?;
    }
    write_f32_slice(w, &t.data)
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_usize<R: Read>(r: &mut R) -> io::Result<usize> {
    usize::try_from(read_u64_le(r)?).map_err(|_| invalid("value does not fit in usize"))
}

/// Read exactly `n` bytes without trusting `n` for the allocation.
fn read_n<R: Read>(r: &mut R, n: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(n as u64).read_to_end(&mut buf)?;
    if buf.len() != n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated image payload",
        ));
    }
    Ok(buf)
}

pub fn read_bytes<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let n = read_u32_le(r)? as usize;
    read_n(r, n)
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes).map_err(|_| invalid("invalid utf-8 string"))
}

pub fn read_f32_vec<R: Read>(r: &mut R) -> io::Result<Vec<f32>> {
    let n = read_u32_le(r)? as usize;
    let bytes = read_n(r, n.saturating_mul(4))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub fn read_f32_rows<R: Read>(r: &mut R) -> io::Result<Vec<Vec<f32>>> {
    let n = read_u32_le(r)? as usize;
    (0..n).map(|_| read_f32_vec(r)).collect()
}

pub fn read_tensor<R: Read>(r: &mut R) -> io::Result<Tensor> {
    let rank = read_u32_le(r)? as usize;
    let shape = (0..rank)
        .map(|_| read_usize(r))
        .collect::<io::Result<Vec<_>>>()?;
    let data = read_f32_vec(r)?;
    if shape.iter().product::<usize>() != data.len() {
        return Err(invalid("tensor shape does not match its data"));
    }
    Ok(Tensor { data, shape })
}

/// Write one chunk: payload is LZ4-compressed and preceded by its
/// uncompressed length.
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = len_u32(payload.len())?;
    let total_len = 4u32.saturating_add(len_u32(compressed.len())?);

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// LZ4 cannot expand a block by more than this factor.
const MAX_LZ4_RATIO: usize = 255;

/// Read and decompress the body of a chunk whose header said `len` bytes.
pub fn read_chunk_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    if len < 4 {
        return Err(invalid("chunk shorter than its header"));
    }
    let uncompressed_len = read_u32_le(r)? as usize;
    let compressed = read_n(r, len as usize - 4)?;
    let bound = compressed
        .len()
        .saturating_mul(MAX_LZ4_RATIO)
        .saturating_add(64);
    if uncompressed_len > bound {
        return Err(invalid("chunk claims an impossible uncompressed size"));
    }
    decompress_lz4(&compressed, uncompressed_len)
}

#[cfg(feature = "serde")]
mod session {
    use std::fs::File;
    use std::io::{self, BufReader, BufWriter, Read, Write};
    use std::path::Path;

    use serde::de::DeserializeOwned;
    use serde::Serialize;

    use super::*;
    use crate::cost::Cost;
    use crate::error::{FitError, Result};
    use crate::fitting::ModelFitting;
    use crate::metrics::Diagnostics;
    use crate::model::NeuralMassModel;
    use crate::recording::{OutputBundle, Recording};
    use crate::stats::{RecordingStat, TrainingStats};
    use crate::update::ParameterHistory;
    use crate::window::{EmpiricalRecording, TrainingSet};

    fn write_training_set<W: Write>(w: &mut W, set: &TrainingSet) -> io::Result<()> {
        write_len(w, set.len())?;
        set.recordings()
            .iter()
            .try_for_each(|rec| write_tensor(w, rec.tensor()))
    }

    fn read_training_set<R: Read>(r: &mut R) -> Result<TrainingSet> {
        let n = read_u32_le(r)? as usize;
        let recordings = (0..n)
            .map(|_| EmpiricalRecording::new(read_tensor(r)?))
            .collect::<Result<Vec<_>>>()?;
        TrainingSet::new(recordings)
    }

    fn write_optional_rows<W: Write>(w: &mut W, rows: Option<&[Vec<f32>]>) -> io::Result<()> {
        match rows {
            Some(rows) => {
                write_u32_le(w, 1)?;
                write_f32_rows(w, rows)
            }
            None => write_u32_le(w, 0),
        }
    }

    fn read_optional_rows<R: Read>(r: &mut R) -> io::Result<Option<Vec<Vec<f32>>>> {
        match read_u32_le(r)? {
            0 => Ok(None),
            1 => Ok(Some(read_f32_rows(r)?)),
            _ => Err(invalid("bad option flag")),
        }
    }

    fn write_stats<W: Write>(w: &mut W, stats: &TrainingStats) -> io::Result<()> {
        write_f32_slice(w, &stats.loss)?;
        write_f32_slice(w, &stats.lr_model)?;
        write_f32_slice(w, &stats.lr_hyper)?;

        write_len(w, stats.diagnostics.len())?;
        for s in &stats.diagnostics {
            write_u64_le(w, s.epoch as u64)?;
            write_u64_le(w, s.recording as u64)?;
            write_f32_le(w, s.last_loss)?;
            write_f32_le(w, s.diagnostics.fc_cor)?;
            write_f32_le(w, s.diagnostics.cos_sim)?;
        }

        let h = &stats.history;
        write_u64_le(w, h.len() as u64)?;
        write_len(w, h.raw_series().len())?;
        for (name, snaps) in h.raw_series() {
            write_string(w, name)?;
            write_f32_rows(w, snaps)?;
        }
        write_optional_rows(w, h.weights())?;
        write_optional_rows(w, h.leadfield())
    }

    fn read_stats<R: Read>(r: &mut R) -> io::Result<TrainingStats> {
        let loss = read_f32_vec(r)?;
        let lr_model = read_f32_vec(r)?;
        let lr_hyper = read_f32_vec(r)?;

        let n = read_u32_le(r)? as usize;
        let diagnostics = (0..n)
            .map(|_| {
                Ok(RecordingStat {
                    epoch: read_usize(r)?,
                    recording: read_usize(r)?,
                    last_loss: read_f32_le(r)?,
                    diagnostics: Diagnostics {
                        fc_cor: read_f32_le(r)?,
                        cos_sim: read_f32_le(r)?,
                    },
                })
            })
            .collect::<io::Result<Vec<_>>>()?;

        let snapshots = read_usize(r)?;
        let n_series = read_u32_le(r)? as usize;
        let series = (0..n_series)
            .map(|_| Ok((read_string(r)?, read_f32_rows(r)?)))
            .collect::<io::Result<Vec<_>>>()?;
        let weights = read_optional_rows(r)?;
        let leadfield = read_optional_rows(r)?;

        Ok(TrainingStats {
            loss,
            lr_model,
            lr_hyper,
            diagnostics,
            history: ParameterHistory::from_parts(series, weights, leadfield, snapshots),
        })
    }

    fn write_bundle<W: Write>(w: &mut W, bundle: &OutputBundle) -> io::Result<()> {
        write_len(w, bundle.len())?;
        for (name, rec) in bundle.iter() {
            write_string(w, name)?;
            write_f32_le(w, rec.step_size)?;
            write_tensor(w, &rec.data)?;
        }
        Ok(())
    }

    fn read_bundle<R: Read>(r: &mut R) -> io::Result<OutputBundle> {
        let n = read_u32_le(r)? as usize;
        let mut bundle = OutputBundle::default();
        for _ in 0..n {
            let name = read_string(r)?;
            let step_size = read_f32_le(r)?;
            let data = read_tensor(r)?;
            bundle.insert(name, Recording::new(data, step_size));
        }
        Ok(bundle)
    }

    fn chunk<F>(w: &mut impl Write, tag: [u8; 4], fill: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<()>,
    {
        let mut payload = Vec::new();
        fill(&mut payload)?;
        write_chunk_lz4(w, tag, &payload)?;
        Ok(())
    }

    impl<M, C> ModelFitting<M, C>
    where
        M: NeuralMassModel + Serialize + DeserializeOwned,
        C: Cost + Serialize + DeserializeOwned,
    {
        /// Write the whole session: model, training data, cost, statistics
        /// and the last simulated recording.
        pub fn save_to<W: Write>(&self, w: &mut W) -> Result<()> {
            w.write_all(MAGIC)?;
            write_u32_le(w, VERSION_CURRENT)?;

            chunk(w, *b"CFG0", |p| Ok(write_u64_le(p, self.num_epochs as u64)?))?;
            chunk(w, *b"DATA", |p| Ok(write_training_set(p, &self.train_data)?))?;
            chunk(w, *b"MODL", |p| Ok(serde_json::to_writer(p, &self.model)?))?;
            chunk(w, *b"COST", |p| Ok(serde_json::to_writer(p, &self.cost)?))?;
            chunk(w, *b"STAT", |p| Ok(write_stats(p, &self.stats)?))?;
            if let Some(bundle) = &self.last_recording {
                chunk(w, *b"LREC", |p| Ok(write_bundle(p, bundle)?))?;
            }
            Ok(())
        }

        /// Load a session image. Unknown chunks are skipped.
        pub fn load_from<R: Read>(r: &mut R) -> Result<Self> {
            let magic = read_exact::<8, _>(r)?;
            if &magic != MAGIC {
                return Err(FitError::Image("bad session image magic".to_string()));
            }
            let version = read_u32_le(r)?;
            if version != VERSION_CURRENT {
                return Err(FitError::Image(format!(
                    "unsupported session image version {}",
                    version
                )));
            }

            let mut num_epochs: Option<usize> = None;
            let mut train_data: Option<TrainingSet> = None;
            let mut model: Option<M> = None;
            let mut cost: Option<C> = None;
            let mut stats: Option<TrainingStats> = None;
            let mut last_recording: Option<OutputBundle> = None;

            loop {
                let (tag, len) = match read_chunk_header(r) {
                    Ok(v) => v,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                };
                let payload = read_chunk_payload(r, len)?;
                let mut cursor = io::Cursor::new(payload);
                match &tag {
                    b"CFG0" => num_epochs = Some(read_usize(&mut cursor)?),
                    b"DATA" => train_data = Some(read_training_set(&mut cursor)?),
                    b"MODL" => model = Some(serde_json::from_reader(&mut cursor)?),
                    b"COST" => cost = Some(serde_json::from_reader(&mut cursor)?),
                    b"STAT" => stats = Some(read_stats(&mut cursor)?),
                    b"LREC" => last_recording = Some(read_bundle(&mut cursor)?),
                    _ => {
                        // Unknown chunk: skipped.
                    }
                }
            }

            let missing = |tag: &str| FitError::Image(format!("missing {}", tag));
            let num_epochs = num_epochs.ok_or_else(|| missing("CFG0"))?;
            let train_data = train_data.ok_or_else(|| missing("DATA"))?;
            let mut model = model.ok_or_else(|| missing("MODL"))?;
            let cost = cost.ok_or_else(|| missing("COST"))?;

            model.params_mut().rebuild_index();
            train_data.check_against(&model.dims())?;

            Ok(Self {
                model,
                train_data,
                num_epochs,
                cost,
                stats: stats.unwrap_or_default(),
                last_recording,
            })
        }

        pub fn save_bytes(&self) -> Result<Vec<u8>> {
            let mut buf = Vec::new();
            self.save_to(&mut buf)?;
            Ok(buf)
        }

        pub fn load_bytes(bytes: &[u8]) -> Result<Self> {
            let mut cursor = io::Cursor::new(bytes);
            Self::load_from(&mut cursor)
        }

        pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
            let mut w = BufWriter::new(File::create(path)?);
            self.save_to(&mut w)?;
            w.flush()?;
            Ok(())
        }

        pub fn load(path: impl AsRef<Path>) -> Result<Self> {
            let mut r = BufReader::new(File::open(path)?);
            Self::load_from(&mut r)
        }

        pub fn image_size_bytes(&self) -> Result<usize> {
            let mut cw = CountingWriter::new();
            self.save_to(&mut cw)?;
            Ok(cw.written())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_round_trip_is_bit_exact() {
        let t = Tensor::from_vec(&[2, 2], vec![0.1, -0.0, f32::MIN_POSITIVE, 1e30]).unwrap();
        let mut buf = Vec::new();
        write_tensor(&mut buf, &t).unwrap();
        let back = read_tensor(&mut io::Cursor::new(buf)).unwrap();
        assert_eq!(back.shape, t.shape);
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&back.data), bits(&t.data));
    }

    #[test]
    fn chunk_round_trip() {
        let mut buf = Vec::new();
        write_chunk_lz4(&mut buf, *b"TEST", &[7u8; 300]).unwrap();
        let mut r = io::Cursor::new(buf);
        let (tag, len) = read_chunk_header(&mut r).unwrap();
        assert_eq!(&tag, b"TEST");
        assert_eq!(read_chunk_payload(&mut r, len).unwrap(), vec![7u8; 300]);
    }

    #[test]
    fn oversized_length_prefix_is_truncation_not_allocation() {
        let mut buf = Vec::new();
        write_u32_le(&mut buf, u32::MAX).unwrap();
        buf.extend_from_slice(&[0u8; 8]);
        let err = read_f32_vec(&mut io::Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn chunk_sizes_from_the_header_are_not_trusted() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"TEST");
        write_u32_le(&mut buf, u32::MAX).unwrap();
        write_u32_le(&mut buf, 16).unwrap();
        buf.extend_from_slice(&[0u8; 4]);
        let mut r = io::Cursor::new(buf);
        let (_, len) = read_chunk_header(&mut r).unwrap();
        let err = read_chunk_payload(&mut r, len).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let compressed = compress_lz4(&[1u8; 32]);
        let mut buf = Vec::new();
        write_u32_le(&mut buf, u32::MAX).unwrap();
        buf.extend_from_slice(&compressed);
        let len = 4 + compressed.len() as u32;
        let err = read_chunk_payload(&mut io::Cursor::new(buf), len).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(feature = "serde")]
    mod session {
        use super::*;
        use crate::config::TrainConfig;
        use crate::cost::TimeSeriesCost;
        use crate::error::FitError;
        use crate::fitting::{simulate, ModelFitting};
        use crate::model::{IcMode, NeuralMassModel};
        use crate::models::delayed_linear::{DelayedLinear, DelayedLinearConfig, OUTPUT_NAME};
        use crate::window::{EmpiricalRecording, TrainingSet};

        type Session = ModelFitting<DelayedLinear, TimeSeriesCost>;

        fn trained() -> Session {
            let cfg = DelayedLinearConfig::default()
                .with_nodes(3, 3)
                .with_grid(2, 4)
                .with_delay(2)
                .with_fit_gains(true);
            let mut truth = DelayedLinear::ring(cfg.clone().with_seed(9)).unwrap();
            let series = simulate(&mut truth, 3, 1, None, IcMode::Training).unwrap();
            let rec =
                EmpiricalRecording::from_series(&series.get(OUTPUT_NAME).unwrap().data, 4).unwrap();
            let model = DelayedLinear::ring(cfg).unwrap();
            let mut fit =
                ModelFitting::new(model, TrainingSet::single(rec), 2, TimeSeriesCost).unwrap();
            let train_cfg = TrainConfig::default()
                .with_early_stop(usize::MAX, 0.0)
                .with_transient(0);
            fit.train(&train_cfg, None).unwrap();
            fit
        }

        fn bits(v: &[f32]) -> Vec<u32> {
            v.iter().map(|x| x.to_bits()).collect()
        }

        #[test]
        fn session_round_trip_preserves_stats_exactly() {
            let fit = trained();
            let bytes = fit.save_bytes().unwrap();
            assert_eq!(fit.image_size_bytes().unwrap(), bytes.len());

            let back = Session::load_bytes(&bytes).unwrap();
            let (a, b) = (fit.stats(), back.stats());
            assert_eq!(bits(&a.loss), bits(&b.loss));
            assert_eq!(bits(&a.lr_model), bits(&b.lr_model));
            assert_eq!(bits(&a.lr_hyper), bits(&b.lr_hyper));
            assert_eq!(a.diagnostics.len(), b.diagnostics.len());
            for (x, y) in a.diagnostics.iter().zip(&b.diagnostics) {
                assert_eq!(x.diagnostics.fc_cor.to_bits(), y.diagnostics.fc_cor.to_bits());
                assert_eq!(x.last_loss.to_bits(), y.last_loss.to_bits());
            }
            assert_eq!(a.history.len(), b.history.len());
            for name in a.history.names() {
                let (sa, sb) = (a.history.series(name).unwrap(), b.history.series(name).unwrap());
                for (x, y) in sa.iter().zip(sb) {
                    assert_eq!(bits(x), bits(y));
                }
            }
            assert_eq!(a.history.weights(), b.history.weights());

            assert_eq!(back.num_epochs(), 2);
            assert_eq!(back.training_data(), fit.training_data());
            assert_eq!(back.last_recording(), fit.last_recording());
            assert_eq!(back.model().params().slot("g"), fit.model().params().slot("g"));
        }

        #[test]
        fn restored_session_keeps_training() {
            let fit = trained();
            let mut back = Session::load_bytes(&fit.save_bytes().unwrap()).unwrap();
            let diag = back.evaluate(1, None).unwrap();
            assert!(diag.cos_sim.is_finite());
        }

        #[test]
        fn unknown_chunks_are_skipped() {
            let fit = trained();
            let mut bytes = fit.save_bytes().unwrap();
            write_chunk_lz4(&mut bytes, *b"XTRA", b"future data").unwrap();
            let back = Session::load_bytes(&bytes).unwrap();
            assert_eq!(back.stats().loss.len(), fit.stats().loss.len());
        }

        #[test]
        fn bad_images_are_rejected() {
            assert!(matches!(
                Session::load_bytes(b"NOTANIMAGE000000"),
                Err(FitError::Image(_))
            ));

            let mut header = Vec::new();
            header.extend_from_slice(MAGIC);
            write_u32_le(&mut header, VERSION_CURRENT).unwrap();
            assert!(matches!(
                Session::load_bytes(&header),
                Err(FitError::Image(msg)) if msg == "missing CFG0"
            ));

            let bytes = trained().save_bytes().unwrap();
            assert!(Session::load_bytes(&bytes[..bytes.len() - 3]).is_err());
        }

        #[test]
        fn save_and_load_through_a_file() {
            let fit = trained();
            let path = std::env::temp_dir().join(format!("nmfit-session-{}.bin", std::process::id()));
            fit.save(&path).unwrap();
            let back = Session::load(&path).unwrap();
            let _ = std::fs::remove_file(&path);
            assert_eq!(bits(&back.stats().loss), bits(&fit.stats().loss));
        }
    }
}
