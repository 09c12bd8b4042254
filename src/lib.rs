//! # Serles：ACME 伺服器核心
//!
//! 本庫實作 ACME（RFC 8555）伺服器的協定核心，並透過 SOAP 將證書簽發橋接至 EJBCA 憑證機構：
//!
//! - **server**: 請求分派器。驗證 nonce 與 JWS、對應各端點到引擎操作，並為每個回應附上新的 `Replay-Nonce`。
//! - **account**: 帳戶註冊、更新、停用與金鑰輪替，以公鑰 thumbprint 為唯一鍵。
//! - **order** / **authorization**: 訂單與授權的狀態機，處理 finalize、過期與對帳。
//! - **validator** / **challenge**: HTTP-01 與 DNS-01 挑戰驗證。
//! - **ca** / **ejbca** / **local_ca**: CA 後端介面、帶重試與硬性逾時的呼叫端，以及 EJBCA SOAP 與行程內 CA 兩種實作。
//! - **nonce**: 防重放的 nonce 集合。
//!
//! ## 特性
//!
//! - 同步、可跨執行緒共用的核心；以實體為單位加鎖，沒有全域鎖
//! - 同一張訂單最多只有一個進行中的 CA 呼叫，逾時後由背景對帳收尾
//! - 記憶體或檔案儲存後端，重新啟動後保留帳戶、訂單與 nonce
//! - 設定可由建構器或環境變數提供
//!
//! ## 使用方式
//!
//! HTTP 監聽與工作執行緒由宿主行程負責。宿主以 [`server::AcmeServer::start`] 建立伺服器，
//! 把每個請求轉為 [`server::AcmeRequest`] 交給 [`server::AcmeServer::handle`]，
//! 結束時呼叫 [`server::AcmeServer::shutdown`]。
//!
//! ```no_run
//! use reqwest::Method;
//! use serles::{
//!     config::{init_logging, ServerConfig},
//!     server::{AcmeRequest, AcmeServer},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. 從環境變數讀取設定並初始化日誌
//!     let config = ServerConfig::from_env()?;
//!     init_logging(&config.log_level);
//!
//!     // 2. 啟動伺服器（開啟儲存、建立 CA 後端、啟動背景維護）
//!     let server = AcmeServer::start(config)?;
//!
//!     // 3. 宿主把收到的請求交給核心處理
//!     let response = server.handle(AcmeRequest::new(
//!         Method::GET,
//!         "https://acme.example.com/directory",
//!     ));
//!     println!("{}", response.status);
//!
//!     // 4. 停止背景維護
//!     server.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! 更多詳細 API 說明請參考各個模組的文檔。

pub mod account;
pub mod authorization;
pub mod base64;
pub mod ca;
pub mod certificate;
pub mod challenge;
pub mod config;
pub mod csr;
pub mod directory;
pub mod ejbca;
pub mod error;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod local_ca;
pub mod maintenance;
pub mod nonce;
pub mod order;
pub mod payload;
pub mod rate_limit;
pub mod server;
pub mod signature;
pub mod storage;
pub mod store;
pub mod validator;
pub mod views;

#[cfg(test)]
mod testing;
