//! Firmware upload engine tests over scripted serial and HTTP mocks

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use hmilink_core::protocol::{Channel, Engine, EngineConfig};
    use hmilink_core::upload::{
        RangeClient, RangeResponse, UploadConfig, UploadError, UploadSession,
    };
    use pretty_assertions::assert_eq;

    /// Serial channel whose inbound side is a script of whole messages, one
    /// per read call. Scripted messages survive `clear_input` so responses
    /// can be queued up front.
    struct MockChannel {
        rx: VecDeque<Vec<u8>>,
        tx: Vec<u8>,
    }

    impl MockChannel {
        fn new() -> Self {
            MockChannel {
                rx: VecDeque::new(),
                tx: Vec::new(),
            }
        }

        fn script(&mut self, message: &[u8]) {
            self.rx.push_back(message.to_vec());
        }

        fn script_resume(&mut self, offset: u32) {
            let mut message = vec![0x08];
            message.extend_from_slice(&offset.to_le_bytes());
            self.rx.push_back(message);
        }
    }

    impl Channel for MockChannel {
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(self.rx.front().map(|m| m.len() as u32).unwrap_or(0))
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.rx.pop_front() {
                Some(message) => {
                    let n = message.len().min(buf.len());
                    buf[..n].copy_from_slice(&message[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.tx.extend_from_slice(buf);
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Serves a synthetic image and records every requested range
    struct MockRangeClient {
        image: Vec<u8>,
        status: u16,
        send_content_range: bool,
        requests: Vec<(u64, u64)>,
    }

    impl MockRangeClient {
        fn new(image_size: usize) -> Self {
            let image = (0..image_size).map(|i| (i % 251) as u8).collect();
            MockRangeClient {
                image,
                status: 206,
                send_content_range: true,
                requests: Vec::new(),
            }
        }
    }

    impl RangeClient for MockRangeClient {
        fn fetch(&mut self, _url: &str, start: u64, end: u64) -> Result<RangeResponse, UploadError> {
            self.requests.push((start, end));
            let len = self.image.len() as u64;
            let body = if self.status == 206 && start < len {
                let stop = (end + 1).min(len) as usize;
                self.image[start as usize..stop].to_vec()
            } else {
                Vec::new()
            };
            Ok(RangeResponse {
                status: self.status,
                total_size: self.send_content_range.then_some(len),
                body,
            })
        }
    }

    fn fast_config() -> UploadConfig {
        UploadConfig {
            url: "http://host/display.tft".to_string(),
            handshake_timeout_ms: 20,
            ack_timeout_ms: 20,
            first_chunk_settle_ms: 0,
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_upload_streams_whole_image_in_windows() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(12_288);
        channel.script(&[0x05]); // ready
        channel.script(&[0x05]); // chunk 1
        channel.script_resume(0); // chunk 2: resume offset 0 means continue
        channel.script(&[0x05]); // chunk 3

        let mut config = fast_config();
        config.memory_budget = 8192;
        let mut session = UploadSession::new(config);
        let total = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap();

        assert_eq!(total, 12_288);
        assert_eq!(
            client.requests,
            vec![(0, 255), (0, 8191), (8192, 12_287)]
        );
        // Announce command, then the raw image bytes.
        let announce = b"whmi-wris 12288,115200,1\xFF\xFF\xFF";
        assert_eq!(&channel.tx[..announce.len()], announce.as_slice());
        assert_eq!(&channel.tx[announce.len()..], &client.image[..]);
    }

    #[test]
    fn test_device_resume_offset_overrides_host_offset() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(12_288);
        channel.script(&[0x05]); // ready
        channel.script_resume(8192); // after chunk 1: skip ahead
        channel.script(&[0x05]); // chunk at 8192

        let mut session = UploadSession::new(fast_config());
        let total = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap();

        assert_eq!(total, 12_288);
        // The rest of the first window is abandoned in favor of the
        // device-reported offset.
        assert_eq!(
            client.requests,
            vec![(0, 255), (0, 12_287), (8192, 12_287)]
        );
    }

    #[test]
    fn test_silence_after_chunk_keeps_streaming() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(8192);
        channel.script(&[0x05]); // ready; no per-chunk responses at all

        let mut session = UploadSession::new(fast_config());
        let total = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap();
        assert_eq!(total, 8192);
    }

    #[test]
    fn test_undersized_image_aborts() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(1024);

        let mut session = UploadSession::new(fast_config());
        let err = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap_err();
        assert!(matches!(err, UploadError::ImageTooSmall(1024)));
        assert!(channel.tx.is_empty());
    }

    #[test]
    fn test_missing_content_range_aborts() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(8192);
        client.send_content_range = false;

        let mut session = UploadSession::new(fast_config());
        let err = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap_err();
        assert!(matches!(err, UploadError::MissingContentRange));
    }

    #[test]
    fn test_http_errors_retry_then_abort() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(8192);
        client.status = 500;

        let mut config = fast_config();
        config.http_retries = 3;
        let mut session = UploadSession::new(config);
        let err = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap_err();
        assert!(matches!(err, UploadError::RetriesExhausted(3)));
        assert_eq!(client.requests.len(), 3);
    }

    #[test]
    fn test_resume_offset_beyond_image_aborts() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(8192);
        channel.script(&[0x05]); // ready
        channel.script_resume(20_000); // past the end of the image

        let mut session = UploadSession::new(fast_config());
        let err = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::InvalidResumeOffset(20_000, 8192)
        ));
        // No range request beyond the negotiation and the first window.
        assert_eq!(client.requests, vec![(0, 255), (0, 8191)]);
    }

    #[test]
    fn test_handshake_junk_response_aborts_immediately() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(8192);
        channel.script(&[0x1A]); // anything but the ready byte

        let mut session = UploadSession::new(fast_config());
        let err = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap_err();
        assert!(matches!(err, UploadError::HandshakeFailed(_)));
        // Only the size probe went out over HTTP.
        assert_eq!(client.requests, vec![(0, 255)]);
    }

    #[test]
    fn test_handshake_timeout_aborts_without_retry() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(8192);
        // No ready byte scripted.

        let mut session = UploadSession::new(fast_config());
        let err = session
            .run(&mut channel, &mut client, 115_200, &mut || {})
            .unwrap_err();
        assert!(matches!(err, UploadError::HandshakeFailed(_)));
        // Size negotiation ran, but no firmware bytes were written.
        assert_eq!(client.requests, vec![(0, 255)]);
    }

    #[test]
    fn test_upload_tft_resets_engine_session_state() {
        let mut channel = MockChannel::new();
        channel.script(&[0x05]); // ready
        channel.script(&[0x05]); // single chunk ack
        let mut engine = Engine::new(channel, EngineConfig::default());
        let mut client = MockRangeClient::new(4096);

        let total = engine.upload_tft(fast_config(), &mut client).unwrap();
        assert_eq!(total, 4096);
        assert!(!engine.is_setup());
        assert_eq!(engine.pending_requests(), 0);

        // The last thing on the wire is the device soft reset.
        let tx = &engine.channel_mut().tx;
        assert!(tx.ends_with(b"rest\xFF\xFF\xFF"));
    }

    #[test]
    fn test_watchdog_fed_during_transfer() {
        let mut channel = MockChannel::new();
        let mut client = MockRangeClient::new(8192);
        channel.script(&[0x05]);

        let mut feeds = 0u32;
        let mut session = UploadSession::new(fast_config());
        session
            .run(&mut channel, &mut client, 115_200, &mut || feeds += 1)
            .unwrap();
        assert!(feeds >= 2);
    }
}
