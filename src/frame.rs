//! # Frame Module
//!
//! A frame is one fixed-size block of samples per channel, delivered once per
//! acquisition cycle. Samples are stored channel-major (`[channel][sample]`),
//! the layout the driver reads into. Files on disk use the transposed
//! `[sample][channel]` layout, so this module also owns both transposes.

/// One multi-channel block of samples, shape `[channels, frame_size]`
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    channels: usize,
    frame_size: usize,
    samples: Vec<f64>,
}

impl Frame {
    pub fn zeros(channels: usize, frame_size: usize) -> Self {
        Self {
            channels,
            frame_size,
            samples: vec![0.0; channels * frame_size],
        }
    }

    /// Build a frame from per-channel sample vectors.
    ///
    /// Channels shorter than the first one are zero-padded, longer ones truncated.
    #[cfg(test)]
    pub fn from_channels(channels: Vec<Vec<f64>>) -> Self {
        let frame_size = channels.first().map(|c| c.len()).unwrap_or(0);
        let mut frame = Self::zeros(channels.len(), frame_size);
        for (i, data) in channels.iter().enumerate() {
            let n = data.len().min(frame_size);
            frame.channel_mut(i)[..n].copy_from_slice(&data[..n]);
        }
        frame
    }

    /// Inverse of [`Frame::transposed_rows`]: one row per sample, one column per channel.
    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let channels = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut frame = Self::zeros(channels, rows.len());
        for (s, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().take(channels).enumerate() {
                frame.samples[c * frame.frame_size + s] = *value;
            }
        }
        frame
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn channel(&self, index: usize) -> &[f64] {
        let start = index * self.frame_size;
        &self.samples[start..start + self.frame_size]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f64] {
        let start = index * self.frame_size;
        &mut self.samples[start..start + self.frame_size]
    }

    /// Reshape and zero-fill. Used when the configurator changes the frame size.
    pub fn resize(&mut self, channels: usize, frame_size: usize) {
        self.channels = channels;
        self.frame_size = frame_size;
        self.samples.clear();
        self.samples.resize(channels * frame_size, 0.0);
    }

    /// Copy another frame's contents, reusing this frame's allocation when shapes match.
    pub fn copy_from(&mut self, other: &Frame) {
        if self.channels != other.channels || self.frame_size != other.frame_size {
            self.resize(other.channels, other.frame_size);
        }
        self.samples.copy_from_slice(&other.samples);
    }

    /// Samples as rows (`[sample][channel]`), the on-disk layout
    pub fn transposed_rows(&self) -> Vec<Vec<f64>> {
        (0..self.frame_size)
            .map(|s| {
                (0..self.channels)
                    .map(|c| self.samples[c * self.frame_size + s])
                    .collect()
            })
            .collect()
    }

    /// Flattened `[sample][channel]` data, row-major
    pub fn transposed_flat(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.samples.len());
        for s in 0..self.frame_size {
            for c in 0..self.channels {
                out.push(self.samples[c * self.frame_size + s]);
            }
        }
        out
    }
}
